use std::io;

/// A full-duplex byte channel to one peer. Writes carry whole frames.
pub trait Link: Send + Sync {
    fn id(&self) -> u64;
    fn write_frame(&self, frame: &[u8]) -> io::Result<()>;
    fn close(&self);
    fn describe(&self) -> String {
        format!("link-{}", self.id())
    }
}
