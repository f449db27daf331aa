mod relay;

pub use relay::relay_command;
