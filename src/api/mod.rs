pub mod openai;
pub mod openai_adapter;
