pub mod rebuild;
pub mod replay;
