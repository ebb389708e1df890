mod poller;

pub use poller::run;
