use std::error::Error;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use clap::Parser;
use nix::cmsg_space;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use serde_derive::{Deserialize, Serialize};

use fmq::{GrantorDescriptor, MessageQueue, SynchronizedReadWrite};

#[derive(Parser)]
#[command(about = "Attaches to a fast message queue and verifies the streamed pattern")]
struct Opts {
    #[arg(short = 'c', long = "config", default_value = "fmq-reader.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReaderConfig {
    socket_path: String,
    chunk: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            socket_path: String::from("/tmp/fmq-demo.sock"),
            chunk: 64,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;

    let stream = UnixStream::connect(&cfg.socket_path)?;
    let mut blob = vec![0u8; 4096];
    let (len, handles) = {
        let mut cmsg_buffer = cmsg_space!([RawFd; 4]);
        let mut iov = [IoSliceMut::new(&mut blob)];
        let msg = recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )?;
        let mut handles: Vec<OwnedFd> = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for fd in fds {
                    // SAFETY: the kernel installed these fds for this process;
                    // nothing else owns them yet.
                    handles.push(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }
        (msg.bytes, handles)
    };

    let descriptor = GrantorDescriptor::deserialize(&blob[..len], handles)?;
    let mut queue = MessageQueue::<u16, SynchronizedReadWrite>::from_descriptor(descriptor)?;
    println!(
        "attached: {} elements of {} bytes",
        queue.quantum_count(),
        queue.quantum_size()
    );

    let start = Instant::now();
    let mut count = 0u64;
    let mut expected = 0u16;
    let mut chunk = vec![0u16; cfg.chunk.max(1)];
    loop {
        if !queue.read_blocking_default(&mut chunk, Duration::from_secs(5)) {
            // The writer has gone quiet; treat it as end of stream.
            break;
        }
        for value in &chunk {
            if *value != expected {
                return Err(format!(
                    "sequence broken at message {}: expected {}, found {}",
                    count, expected, value
                )
                .into());
            }
            expected = expected.wrapping_add(1);
            count += 1;
        }
    }
    let duration = start.elapsed();
    let iops = ((count as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "read {} messages, IOPS : {:#?}K, time: {:#?}",
        count,
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
