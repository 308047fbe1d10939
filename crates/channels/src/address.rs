use std::fmt;

/// Address suffix for one-to-one chats.
pub const INDIVIDUAL_SUFFIX: &str = "@s.whatsapp.net";

/// Address suffix for group chats.
pub const GROUP_SUFFIX: &str = "@g.us";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Individual,
    Group,
}

/// A fully-qualified chat address (`<user>@s.whatsapp.net` or `<id>@g.us`).
///
/// Only constructible through [`Address::individual`] and [`Address::group`],
/// so anything handed to a session adapter already has one of the two
/// canonical shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    kind: AddressKind,
    jid: String,
}

impl Address {
    /// Build an individual address from a bare user part (digits).
    pub fn individual(user: &str) -> Self {
        Self {
            kind: AddressKind::Individual,
            jid: format!("{user}{INDIVIDUAL_SUFFIX}"),
        }
    }

    /// Build a group address; an existing `@g.us` suffix is kept as-is.
    pub fn group(id: &str) -> Self {
        let jid = if id.contains(GROUP_SUFFIX) {
            id.to_string()
        } else {
            format!("{id}{GROUP_SUFFIX}")
        };
        Self {
            kind: AddressKind::Group,
            jid,
        }
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.jid
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.jid)
    }
}
