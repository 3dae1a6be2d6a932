//! Per-chat notification filters.
//!
//! A fixed set of named flags. Settings commands toggle them by name through
//! [`NotificationFilter::flag_mut`], which returns a typed reference to the
//! matching field.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationFlag {
    Comments,
    Moves,
    Renames,
    Archives,
    DueDates,
    Descriptions,
    Attachments,
    Members,
    Labels,
}

impl NotificationFlag {
    pub const ALL: [NotificationFlag; 9] = [
        NotificationFlag::Comments,
        NotificationFlag::Moves,
        NotificationFlag::Renames,
        NotificationFlag::Archives,
        NotificationFlag::DueDates,
        NotificationFlag::Descriptions,
        NotificationFlag::Attachments,
        NotificationFlag::Members,
        NotificationFlag::Labels,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NotificationFlag::Comments => "comments",
            NotificationFlag::Moves => "moves",
            NotificationFlag::Renames => "renames",
            NotificationFlag::Archives => "archives",
            NotificationFlag::DueDates => "due_dates",
            NotificationFlag::Descriptions => "descriptions",
            NotificationFlag::Attachments => "attachments",
            NotificationFlag::Members => "members",
            NotificationFlag::Labels => "labels",
        }
    }
}

impl std::fmt::Display for NotificationFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for NotificationFlag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NotificationFlag::ALL
            .into_iter()
            .find(|flag| flag.name() == s)
            .ok_or_else(|| Error::NotFound(format!("notification flag {s:?}")))
    }
}

/// Which event categories a chat wants to hear about. Everything is on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationFilter {
    pub comments: bool,
    pub moves: bool,
    pub renames: bool,
    pub archives: bool,
    pub due_dates: bool,
    pub descriptions: bool,
    pub attachments: bool,
    pub members: bool,
    pub labels: bool,
}

impl Default for NotificationFilter {
    fn default() -> Self {
        Self {
            comments: true,
            moves: true,
            renames: true,
            archives: true,
            due_dates: true,
            descriptions: true,
            attachments: true,
            members: true,
            labels: true,
        }
    }
}

impl NotificationFilter {
    pub fn flag_mut(&mut self, flag: NotificationFlag) -> &mut bool {
        match flag {
            NotificationFlag::Comments => &mut self.comments,
            NotificationFlag::Moves => &mut self.moves,
            NotificationFlag::Renames => &mut self.renames,
            NotificationFlag::Archives => &mut self.archives,
            NotificationFlag::DueDates => &mut self.due_dates,
            NotificationFlag::Descriptions => &mut self.descriptions,
            NotificationFlag::Attachments => &mut self.attachments,
            NotificationFlag::Members => &mut self.members,
            NotificationFlag::Labels => &mut self.labels,
        }
    }

    pub fn is_enabled(&self, flag: NotificationFlag) -> bool {
        let mut copy = *self;
        *copy.flag_mut(flag)
    }

    /// Flip the flag called `name`; returns its new value.
    pub fn toggle(&mut self, name: &str) -> Result<bool> {
        let flag: NotificationFlag = name.parse()?;
        let value = self.flag_mut(flag);
        *value = !*value;
        Ok(*value)
    }
}
