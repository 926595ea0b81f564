pub mod coze;
pub mod openai;
