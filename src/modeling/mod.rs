//! Leakage modeling with LDA dimensionality reduction and Gaussian templates.
//!
//! Fitting chains [`scatter::scatter`], [`projection::fisher_projection`] and
//! [`template::fit_templates`] into an immutable [`LdaModel`]. [`LdaClassifier`] wraps the model
//! behind `fit` / `predict_proba` / `export_state` / `import_state`.
pub mod lda;
pub mod projection;
pub mod scatter;
pub mod template;

pub use lda::{LdaClassifier, LdaModel, ModelState};
pub use template::CovarianceDecomposition;
