use async_trait::async_trait;
use aya::maps::{MapData, RingBuf};
use tokio::io::unix::AsyncFd;

use crate::record::{RawEventRecord, RecordError, RecordSource};

/// Records read from a BPF_MAP_TYPE_RINGBUF, woken up by epoll.
pub struct RingBufSource {
    name: String,
    fd: AsyncFd<RingBuf<MapData>>,
}

impl RingBufSource {
    pub fn new(name: &str, ring: RingBuf<MapData>) -> std::io::Result<Self> {
        // SAFETY: the ring buffer owns its map fd, which stays open until
        // the `AsyncFd` drops it.
        let fd = unsafe { AsyncFd::register(ring)? };
        Ok(Self {
            name: name.to_string(),
            fd,
        })
    }
}

#[async_trait]
impl RecordSource for RingBufSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fill_batch(
        &mut self,
        batch: &mut Vec<Result<RawEventRecord, RecordError>>,
        max: usize,
    ) -> Result<(), RecordError> {
        loop {
            let mut guard = self.fd.readable_mut().await?;
            let ring = guard.get_inner_mut();
            let start = batch.len();
            while batch.len() - start < max {
                match ring.next() {
                    Some(item) => batch.push(RawEventRecord::from_wire(&item)),
                    None => break,
                }
            }
            let read = batch.len() - start;
            if read < max {
                // ring drained, wait for the next wakeup
                guard.clear_ready();
            }
            if read > 0 {
                return Ok(());
            }
        }
    }
}
