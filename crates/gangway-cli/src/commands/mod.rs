pub mod check;
pub mod deploy;
pub mod validate;
