pub mod agents;
pub mod cron;
pub mod history;
pub mod info;
pub mod serve;
pub mod worker;
