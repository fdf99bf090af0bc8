pub mod assembler;
pub mod pdf;
