use thiserror::Error;

/// Errors raised by the tree, metric and record layers.
#[derive(Error, Debug)]
pub enum TreebenchError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("{path}: malformed Newick at byte {offset}: {message}")]
    Newick {
        path: String,
        offset: usize,
        message: String,
    },
    #[error("{path}: duplicate leaf label: {label}")]
    DuplicateLeaf { path: String, label: String },
    #[error("{reference} and {estimate} share only {shared} taxa; at least 4 are required")]
    TooFewSharedTaxa {
        reference: String,
        estimate: String,
        shared: usize,
    },
    #[error("{path} line {line}: {message}")]
    Csv {
        path: String,
        line: usize,
        message: String,
    },
    #[error("{path}: malformed sidecar: {message}")]
    Sidecar { path: String, message: String },
    #[error("{path}: malformed localization map: {message}")]
    Localization { path: String, message: String },
    #[error("condition {condition}: method {method_a} has {n_a} samples but {method_b} has {n_b}")]
    SampleCountMismatch {
        condition: String,
        method_a: String,
        n_a: usize,
        method_b: String,
        n_b: usize,
    },
    #[error("column {0} not found in input header")]
    UnknownMetric(String),
}

pub type Result<T> = std::result::Result<T, TreebenchError>;
