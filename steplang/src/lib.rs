//! The constrained step language executed inside the sandbox.
//!
//! Root models drive the runtime by writing short programs in a closed Python
//! subset. This crate owns the whole pipeline for one step: lexing and
//! parsing ([`parse_program`]), the static policy gate ([`check_policy`]) and
//! the restricted tree-walking evaluator ([`run_step`]).
//!
//! The evaluator is synchronous and performs no I/O of its own; document
//! access goes through the [`CorpusHost`] trait, which the runtime implements
//! with span-logged object-store range reads. Tool calls are only ever
//! queued, never resolved here.

mod ast;
mod error;
mod interp;
mod parser;
mod policy;
mod token;
mod value;

pub use ast::Loc;
pub use ast::Program;
pub use error::EvalError;
pub use error::EvalErrorKind;
pub use error::HostError;
pub use error::HostErrorKind;
pub use error::ParseError;
pub use interp::CorpusHost;
pub use interp::SectionSpan;
pub use interp::StepLimits;
pub use interp::StepOutcome;
pub use interp::Terminator;
pub use interp::run_step;
pub use parser::parse_program;
pub use policy::PolicyViolation;
pub use policy::check_policy;
