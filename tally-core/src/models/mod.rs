pub mod answer;
pub mod context;
pub mod query;
pub mod question;
pub mod run;
pub mod scores;
pub mod ticket;
