pub mod gateway;
pub mod snowflake;
pub mod voice;

pub use snowflake::Snowflake;
