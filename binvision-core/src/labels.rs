/// Waste categories that break down naturally.
pub const BIODEGRADABLE: [&str; 3] = ["cardboard", "paper", "trash"];
/// Waste categories that do not.
pub const NON_BIODEGRADABLE: [&str; 3] = ["glass", "metal", "plastic"];

/// Output labels of the waste classifier, in the index order of its final layer.
pub const LABELS: [&str; 6] = [
    BIODEGRADABLE[0],
    BIODEGRADABLE[1],
    BIODEGRADABLE[2],
    NON_BIODEGRADABLE[0],
    NON_BIODEGRADABLE[1],
    NON_BIODEGRADABLE[2],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Biodegradable,
    NonBiodegradable,
}

/// Returns the group of a label, `None` for anything outside [`LABELS`].
pub fn group_of(label: &str) -> Option<Group> {
    if BIODEGRADABLE.contains(&label) {
        Some(Group::Biodegradable)
    } else if NON_BIODEGRADABLE.contains(&label) {
        Some(Group::NonBiodegradable)
    } else {
        None
    }
}

/// Maps an output index of the classifier to its label.
pub fn label_at(index: usize) -> Option<&'static str> {
    LABELS.get(index).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_order() {
        assert_eq!(
            LABELS,
            ["cardboard", "paper", "trash", "glass", "metal", "plastic"]
        );
    }

    #[test]
    fn test_group_of() {
        assert_eq!(group_of("paper"), Some(Group::Biodegradable));
        assert_eq!(group_of("metal"), Some(Group::NonBiodegradable));
        assert_eq!(group_of("banana"), None);
        assert!(LABELS.iter().all(|l| group_of(l).is_some()));
    }

    #[test]
    fn test_label_at() {
        assert_eq!(label_at(0), Some("cardboard"));
        assert_eq!(label_at(5), Some("plastic"));
        assert_eq!(label_at(6), None);
    }
}
