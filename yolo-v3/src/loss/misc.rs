use crate::common::*;

/// The loss applied to class predictions at responsible slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassificationLossKind {
    /// Independent binary cross-entropy per class.
    Bce,
    /// Softmax cross-entropy over all classes.
    CrossEntropy,
}

impl Default for ClassificationLossKind {
    fn default() -> Self {
        Self::Bce
    }
}
