pub mod exframe;
pub mod line;
pub mod upstream_link;

pub use exframe::{ExFrame, ExFrameCodec, ExFrameError};
pub use line::{LineCodec, LineCodecError};
pub use upstream_link::{UpstreamFrame, UpstreamLinkCodec};
