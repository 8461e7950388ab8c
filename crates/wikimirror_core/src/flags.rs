use serde::Serialize;

/// Visibility bitmask stored in `*_deleted` columns.
///
/// Bit 1 means "text hidden" for revisions and recent-change edits and
/// "action hidden" for log events; the remaining bits are shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DeletedFlags(u8);

impl DeletedFlags {
    pub const TEXT: u8 = 1;
    pub const ACTION: u8 = 1;
    pub const COMMENT: u8 = 2;
    pub const USER: u8 = 4;
    pub const RESTRICTED: u8 = 8;
    pub const ALL: u8 = Self::TEXT | Self::COMMENT | Self::USER | Self::RESTRICTED;

    pub fn from_bits(bits: i64) -> Self {
        Self((bits & i64::from(Self::ALL)) as u8)
    }

    pub fn bits(self) -> i64 {
        i64::from(self.0)
    }

    pub fn all() -> Self {
        Self(Self::ALL)
    }

    /// Builds the mask from the hidden-state booleans reported by the remote API.
    pub fn from_hidden(
        content_hidden: bool,
        comment_hidden: bool,
        user_hidden: bool,
        suppressed: bool,
    ) -> Self {
        let mut bits = 0;
        if content_hidden {
            bits |= Self::TEXT;
        }
        if comment_hidden {
            bits |= Self::COMMENT;
        }
        if user_hidden {
            bits |= Self::USER;
        }
        if suppressed {
            bits |= Self::RESTRICTED;
        }
        Self(bits)
    }

    pub fn text_hidden(self) -> bool {
        self.0 & Self::TEXT != 0
    }

    pub fn action_hidden(self) -> bool {
        self.0 & Self::ACTION != 0
    }

    pub fn comment_hidden(self) -> bool {
        self.0 & Self::COMMENT != 0
    }

    pub fn user_hidden(self) -> bool {
        self.0 & Self::USER != 0
    }

    pub fn suppressed(self) -> bool {
        self.0 & Self::RESTRICTED != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Which entity a visibility mask belongs to; decides the name of bit 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityTarget {
    Content,
    LogAction,
}

impl DeletedFlags {
    /// Presence-flag names the remote protocol uses for this mask.
    pub fn flag_names(self, target: VisibilityTarget) -> Vec<&'static str> {
        let mut out = Vec::new();
        match target {
            VisibilityTarget::Content if self.text_hidden() => out.push("sha1hidden"),
            VisibilityTarget::LogAction if self.action_hidden() => out.push("actionhidden"),
            _ => {}
        }
        if self.comment_hidden() {
            out.push("commenthidden");
        }
        if self.user_hidden() {
            out.push("userhidden");
        }
        if self.suppressed() {
            out.push("suppressed");
        }
        out
    }
}
