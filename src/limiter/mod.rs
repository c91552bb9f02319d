pub mod stream;
pub mod token_bucket;

use bytes::Bytes;

pub use stream::StreamRateLimiter;
pub use token_bucket::TokenBucket;

/// Hooks into the response stream a rate limiter paces.
///
/// Called from the stream's own execution context only.
pub trait StreamCallbacks: Send {
    /// Ask the upstream producer to stop sending data.
    fn pause_data(&mut self);

    /// Let a paused producer send again.
    fn resume_data(&mut self);

    /// Forward paced data towards the client.
    fn write_data(&mut self, data: Bytes, end_stream: bool);

    /// Release trailers held until all buffered data was written.
    fn continue_trailers(&mut self) {}
}

impl<T: StreamCallbacks + ?Sized> StreamCallbacks for Box<T> {
    fn pause_data(&mut self) {
        (**self).pause_data()
    }

    fn resume_data(&mut self) {
        (**self).resume_data()
    }

    fn write_data(&mut self, data: Bytes, end_stream: bool) {
        (**self).write_data(data, end_stream)
    }

    fn continue_trailers(&mut self) {
        (**self).continue_trailers()
    }
}
