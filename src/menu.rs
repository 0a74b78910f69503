//! The toolkit independent model of the tray's popup menu.
//!
//! Backends never see the callbacks, they render [`MenuSnapshot`]s and report activations back by
//! [`EntryId`].

use std::fmt;

/// Stable identifier of a menu row, it survives relabelling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    #[cfg_attr(target_os = "linux", allow(dead_code))]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[cfg_attr(target_os = "linux", allow(dead_code))]
    pub(crate) const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotItem {
    pub id: EntryId,
    pub label: String,
    /// Disabled rows (the status line) are shown, but can't be clicked
    pub enabled: bool,
}

/// What a backend needs to know to draw the menu
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MenuSnapshot {
    pub items: Vec<SnapshotItem>,
}

impl MenuSnapshot {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: EntryId) -> Option<&SnapshotItem> {
        self.items.iter().find(|item| item.id == id)
    }
}

enum Item<C> {
    Entry {
        id: EntryId,
        label: String,
        callback: C,
    },
    Status {
        id: EntryId,
        text: String,
    },
}

impl<C> Item<C> {
    #[cfg(test)]
    fn id(&self) -> EntryId {
        match self {
            Item::Entry { id, .. } | Item::Status { id, .. } => *id,
        }
    }
}

/// How a call changed the model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Change {
    Added,
    Updated,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("A menu entry labelled '{0}' already exists")]
pub(crate) struct DuplicateLabel(pub String);

/// Ordered menu entries, each with a callback of type `C`, and at most one status line.
pub(crate) struct MenuModel<C> {
    items: Vec<Item<C>>,
    next_id: u64,
}

impl<C> Default for MenuModel<C> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            next_id: 0,
        }
    }
}

impl<C: Clone> MenuModel<C> {
    fn allocate_id(&mut self) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        id
    }

    fn position(&self, label: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|item| matches!(item, Item::Entry { label: l, .. } if l == label))
    }

    /// Appends an entry, or replaces the callback of the entry that already has this label.
    pub fn add_entry(&mut self, label: &str, callback: C) -> Change {
        if let Some(idx) = self.position(label) {
            if let Item::Entry { callback: old, .. } = &mut self.items[idx] {
                *old = callback;
                return Change::Updated;
            }
        }

        let id = self.allocate_id();
        self.items.push(Item::Entry {
            id,
            label: label.to_owned(),
            callback,
        });
        Change::Added
    }

    /// Relabels the entry called `orig_label` and replaces its callback. If there's no such
    /// entry, one labelled `orig_label` gets appended instead, with the new callback.
    pub fn update_entry(
        &mut self,
        orig_label: &str,
        new_label: &str,
        callback: C,
    ) -> Result<Change, DuplicateLabel> {
        let Some(idx) = self.position(orig_label) else {
            return Ok(self.add_entry(orig_label, callback));
        };

        if orig_label != new_label && self.position(new_label).is_some() {
            return Err(DuplicateLabel(new_label.to_owned()));
        }

        let Item::Entry {
            label,
            callback: old,
            ..
        } = &mut self.items[idx]
        else {
            unreachable!("position() only matches entries");
        };
        *label = new_label.to_owned();
        *old = callback;

        Ok(Change::Updated)
    }

    /// Sets the text of the status line, appending it to the menu the first time around.
    pub fn set_status(&mut self, text: &str) -> Change {
        for item in &mut self.items {
            if let Item::Status { text: old, .. } = item {
                text.clone_into(old);
                return Change::Updated;
            }
        }

        let id = self.allocate_id();
        self.items.push(Item::Status {
            id,
            text: text.to_owned(),
        });
        Change::Added
    }

    pub fn callback(&self, id: EntryId) -> Option<C> {
        self.items.iter().find_map(|item| match item {
            Item::Entry {
                id: entry_id,
                callback,
                ..
            } if *entry_id == id => Some(callback.clone()),
            _ => None,
        })
    }

    #[cfg(test)]
    pub fn contains(&self, id: EntryId) -> bool {
        self.items.iter().any(|item| item.id() == id)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn snapshot(&self) -> MenuSnapshot {
        let items = self
            .items
            .iter()
            .map(|item| match item {
                Item::Entry { id, label, .. } => SnapshotItem {
                    id: *id,
                    label: label.clone(),
                    enabled: true,
                },
                Item::Status { id, text } => SnapshotItem {
                    id: *id,
                    label: text.clone(),
                    enabled: false,
                },
            })
            .collect();

        MenuSnapshot { items }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(model: &MenuModel<&'static str>) -> Vec<(String, bool)> {
        model
            .snapshot()
            .items
            .into_iter()
            .map(|item| (item.label, item.enabled))
            .collect()
    }

    fn id_of(model: &MenuModel<&'static str>, label: &str) -> EntryId {
        model
            .snapshot()
            .items
            .into_iter()
            .find(|item| item.label == label)
            .unwrap()
            .id
    }

    #[test]
    fn add_appends_in_order() {
        let mut model = MenuModel::default();
        assert_eq!(model.add_entry("Open", "open"), Change::Added);
        assert_eq!(model.add_entry("Quit", "quit"), Change::Added);

        assert_ne!(id_of(&model, "Open"), id_of(&model, "Quit"));
        assert_eq!(
            labels(&model),
            [("Open".to_owned(), true), ("Quit".to_owned(), true)]
        );
    }

    #[test]
    fn adding_existing_label_replaces_callback() {
        let mut model = MenuModel::default();
        model.add_entry("Open", "old");
        let id = id_of(&model, "Open");

        assert_eq!(model.add_entry("Open", "new"), Change::Updated);
        assert_eq!(model.callback(id), Some("new"));
        assert_eq!(model.snapshot().items.len(), 1);
    }

    #[test]
    fn update_relabels_in_place() {
        let mut model = MenuModel::default();
        model.add_entry("Connect", "connect");
        model.add_entry("Pause", "pause");
        model.add_entry("Quit", "quit");
        let id = id_of(&model, "Pause");

        assert_eq!(
            model.update_entry("Pause", "Resume", "resume"),
            Ok(Change::Updated)
        );
        assert_eq!(id_of(&model, "Resume"), id);
        assert_eq!(model.callback(id), Some("resume"));
        assert_eq!(
            labels(&model),
            [
                ("Connect".to_owned(), true),
                ("Resume".to_owned(), true),
                ("Quit".to_owned(), true)
            ]
        );
    }

    #[test]
    fn update_of_missing_entry_adds_it_under_its_old_label() {
        let mut model = MenuModel::default();

        assert_eq!(
            model.update_entry("Connect", "Disconnect", "disconnect"),
            Ok(Change::Added)
        );
        assert_eq!(labels(&model), [("Connect".to_owned(), true)]);
        assert_eq!(model.callback(id_of(&model, "Connect")), Some("disconnect"));

        // The entry exists now, so the next update relabels it
        assert_eq!(
            model.update_entry("Connect", "Disconnect", "disconnect"),
            Ok(Change::Updated)
        );
        assert_eq!(labels(&model), [("Disconnect".to_owned(), true)]);
    }

    #[test]
    fn update_refuses_to_duplicate_labels() {
        let mut model = MenuModel::default();
        model.add_entry("A", "a");
        model.add_entry("B", "b");

        assert_eq!(
            model.update_entry("A", "B", "x"),
            Err(DuplicateLabel("B".to_owned()))
        );
        // Renaming onto itself is just a callback swap
        assert_eq!(model.update_entry("A", "A", "x"), Ok(Change::Updated));
        assert_eq!(model.callback(id_of(&model, "A")), Some("x"));
    }

    #[test]
    fn status_line_is_disabled_and_kept_in_place() {
        let mut model = MenuModel::default();
        model.add_entry("Open", "open");
        assert_eq!(model.set_status("Connecting"), Change::Added);
        model.add_entry("Quit", "quit");
        let status = id_of(&model, "Connecting");

        assert_eq!(model.set_status("Connected"), Change::Updated);
        assert_eq!(model.callback(status), None);
        assert!(model.contains(status));
        assert_eq!(
            labels(&model),
            [
                ("Open".to_owned(), true),
                ("Connected".to_owned(), false),
                ("Quit".to_owned(), true)
            ]
        );
    }

    #[test]
    fn ids_are_not_reused_after_clear() {
        let mut model = MenuModel::default();
        model.add_entry("Open", "open");
        let before = id_of(&model, "Open");
        model.clear();
        assert!(model.snapshot().is_empty());
        assert!(!model.contains(before));

        model.add_entry("Open", "open");
        assert_ne!(before, id_of(&model, "Open"));
    }
}
