//! The typed Loop IR and its effect sublanguage.

pub mod effect;
pub mod ir;
