//! Change detection for "entity updated" payloads.
//!
//! Providers often report a single update with an `old` object holding the
//! previous values of whatever changed. Exactly one cause is reported per
//! update, picked in a fixed priority order, so one physical webhook never
//! turns into several near-identical notifications.

use serde_json::Value;

use crate::flags::NotificationFlag;

/// What an update changed, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeCause {
    Moved,
    Renamed,
    ArchiveToggled,
    DueChanged,
    DescriptionChanged,
}

impl ChangeCause {
    /// Priority order.
    pub const ORDER: [ChangeCause; 5] = [
        ChangeCause::Moved,
        ChangeCause::Renamed,
        ChangeCause::ArchiveToggled,
        ChangeCause::DueChanged,
        ChangeCause::DescriptionChanged,
    ];

    /// Field names a provider may use for this cause.
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            ChangeCause::Moved => &["list", "idList", "column"],
            ChangeCause::Renamed => &["name", "title"],
            ChangeCause::ArchiveToggled => &["archived", "closed"],
            ChangeCause::DueChanged => &["due", "due_date"],
            ChangeCause::DescriptionChanged => &["description", "desc"],
        }
    }

    pub fn flag(self) -> NotificationFlag {
        match self {
            ChangeCause::Moved => NotificationFlag::Moves,
            ChangeCause::Renamed => NotificationFlag::Renames,
            ChangeCause::ArchiveToggled => NotificationFlag::Archives,
            ChangeCause::DueChanged => NotificationFlag::DueDates,
            ChangeCause::DescriptionChanged => NotificationFlag::Descriptions,
        }
    }

    /// The field of this cause present in `old`, with its old and new value.
    pub fn change<'a>(self, old: &'a Value, new: &'a Value) -> Option<(&'static str, &'a Value, Option<&'a Value>)> {
        self.fields().iter().find_map(|field| {
            let before = old.get(*field)?;
            let after = new.get(*field);
            if after == Some(before) {
                None
            } else {
                Some((*field, before, after))
            }
        })
    }
}

/// First cause, in priority order, whose field appears in `old` with a
/// value different from `new`.
pub fn detect(old: &Value, new: &Value) -> Option<ChangeCause> {
    ChangeCause::ORDER
        .into_iter()
        .find(|cause| cause.change(old, new).is_some())
}
