mod cancel;

pub use cancel::*;
pub use tokio_util::sync::CancellationToken;
