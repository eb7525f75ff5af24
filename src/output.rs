//! Output writer: bridges a child's stdout/stderr pipes into the store.
//!
//! One reader thread per stream. Bytes are read in chunks (not lines) so
//! output without a trailing newline reaches subscribers immediately, and
//! each chunk is copied before it is handed to the store because the read
//! buffer is reused. The sink never fails: read errors end the stream and
//! appends to a finished job are already no-ops in the store.

use std::io::Read;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::store::JobStore;

const READ_BUF_SIZE: usize = 8192;

/// Spawn a reader thread that appends everything arriving on `stream` to
/// the job's output buffer until EOF.
pub(crate) fn spawn_reader<R>(
    stream: R,
    store: Arc<JobStore>,
    job_id: String,
    label: &'static str,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut stream = stream;
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut total: u64 = 0;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break, // EOF
                Ok(n) => {
                    total += n as u64;
                    store.append(&job_id, &buf[..n]);
                }
                Err(e) => {
                    debug!(job_id = %job_id, label, error = %e, "output stream read ended");
                    break;
                }
            }
        }
        debug!(job_id = %job_id, label, total, "output stream closed");
    })
}
