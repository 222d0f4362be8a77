use std::error::Error;
use std::io::IoSlice;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGINT, SIGTERM};

use fmq::{MessageQueue, QueueConfig, SynchronizedReadWrite};

#[derive(Parser)]
#[command(about = "Creates a fast message queue and streams a test pattern to one reader")]
struct Opts {
    #[arg(short = 'c', long = "config", default_value = "fmq-writer.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WriterConfig {
    queue: QueueConfig,
    socket_path: String,
    chunk: usize,
    messages: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            queue: QueueConfig {
                quantum_count: 1024,
                event_flag: true,
            },
            socket_path: String::from("/tmp/fmq-demo.sock"),
            chunk: 64,
            messages: 1_000_000,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts = Opts::parse();
    let cfg: WriterConfig = confy::load_path(&opts.config)?;

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;

    let mut queue = MessageQueue::<u16, SynchronizedReadWrite>::create(&cfg.queue)?;

    let _ = std::fs::remove_file(&cfg.socket_path);
    let listener = UnixListener::bind(&cfg.socket_path)?;
    println!("waiting for a reader on {}", cfg.socket_path);
    let (stream, _) = listener.accept()?;

    let descriptor = queue.descriptor()?;
    let blob = descriptor.serialize();
    let raw_fds: Vec<i32> = descriptor
        .handles()
        .iter()
        .map(|fd| fd.as_raw_fd())
        .collect();
    let iov = [IoSlice::new(&blob)];
    let cmsgs = [ControlMessage::ScmRights(&raw_fds)];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
    println!(
        "descriptor sent ({} bytes, {} handles)",
        blob.len(),
        raw_fds.len()
    );

    let mut sent = 0u64;
    let mut value = 0u16;
    let mut chunk = vec![0u16; cfg.chunk.max(1)];
    while sent < cfg.messages && !stop.load(Ordering::Relaxed) {
        for slot in chunk.iter_mut() {
            *slot = value;
            value = value.wrapping_add(1);
        }
        if !queue.write_blocking_default(&chunk, Duration::from_secs(5)) {
            println!("reader stalled; stopping after {} messages", sent);
            break;
        }
        sent += chunk.len() as u64;
    }
    println!("wrote {} messages", sent);

    let _ = std::fs::remove_file(&cfg.socket_path);
    Ok(())
}
