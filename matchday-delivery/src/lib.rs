mod push;
mod realtime;

pub use push::HttpPushGateway;
pub use realtime::RedisRealtimePublisher;
