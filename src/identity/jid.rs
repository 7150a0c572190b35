//! WhatsApp address (JID) parsing and phone normalization.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Canonical phone shape: no leading zero, 10–15 digits in total.
static CANONICAL_PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[1-9][0-9]{9,14}$").expect("static regex"));

/// Server half of a JID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JidServer {
    /// `s.whatsapp.net` (or legacy `c.us`): user part is a phone number
    Phone,
    /// `lid`: user part is an opaque identifier
    Lid,
    /// `g.us`
    Group,
    /// `broadcast` (includes `status@broadcast`)
    Broadcast,
    /// `newsletter`
    Newsletter,
    Other(String),
}

/// Parsed `user[:device]@server` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jid {
    pub user: String,
    pub server: JidServer,
}

impl Jid {
    /// Parse a raw address. A bare string without `@` is treated as a phone
    /// JID so API callers can pass plain numbers.
    pub fn parse(raw: &str) -> Option<Jid> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let (user, server) = match raw.split_once('@') {
            Some((u, s)) => (u, s),
            None => (raw, "s.whatsapp.net"),
        };
        // Strip device (`:12`) and agent (`.0`) suffixes used on multi-device ids.
        let user = user.split(':').next().unwrap_or(user);
        let server = match server.to_ascii_lowercase().as_str() {
            "s.whatsapp.net" | "c.us" => JidServer::Phone,
            "lid" => JidServer::Lid,
            "g.us" => JidServer::Group,
            "broadcast" => JidServer::Broadcast,
            "newsletter" => JidServer::Newsletter,
            other => JidServer::Other(other.to_string()),
        };
        let user = if server == JidServer::Lid {
            user.split('.').next().unwrap_or(user)
        } else {
            user
        };
        if user.is_empty() {
            return None;
        }
        Some(Jid {
            user: user.to_string(),
            server,
        })
    }

    /// Phone JID for a canonical number.
    pub fn phone(number: &str) -> Jid {
        Jid {
            user: number.to_string(),
            server: JidServer::Phone,
        }
    }

    pub fn lid(id: &str) -> Jid {
        Jid {
            user: id.to_string(),
            server: JidServer::Lid,
        }
    }

    pub fn is_lid(&self) -> bool {
        self.server == JidServer::Lid
    }

    pub fn is_group(&self) -> bool {
        self.server == JidServer::Group
    }

    /// Broadcast lists, `status@broadcast` and newsletters.
    pub fn is_broadcast_like(&self) -> bool {
        matches!(self.server, JidServer::Broadcast | JidServer::Newsletter)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let server = match &self.server {
            JidServer::Phone => "s.whatsapp.net",
            JidServer::Lid => "lid",
            JidServer::Group => "g.us",
            JidServer::Broadcast => "broadcast",
            JidServer::Newsletter => "newsletter",
            JidServer::Other(s) => s.as_str(),
        };
        write!(f, "{}@{}", self.user, server)
    }
}

/// Keep only ASCII digits: `"+39 380-651 0543"` → `"393806510543"`.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// True if `digits` has the canonical phone shape.
pub fn is_canonical_phone(digits: &str) -> bool {
    CANONICAL_PHONE.is_match(digits)
}
