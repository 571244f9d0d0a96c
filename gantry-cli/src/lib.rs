pub mod mods;
pub mod tokenizer;
