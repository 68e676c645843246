//! Pipe CLI demo
//!
//! Copies stdin lines into `scullpipe0` and prints what a reader on the same
//! pipe receives. An async listener reports every write out-of-band, the
//! way a SIGIO handler would.
//!
//! Run with `RUST_LOG=debug` to see the pipe's own tracing.

use embedded_io_async::Read;
use scull::{AccessMode, AsyncEvent, Caller, Credentials, DeviceConfig, DeviceRegistry, OpenFlags};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let registry = DeviceRegistry::new(DeviceConfig::default())?;
    let caller = Caller::new(Credentials::user(1000));

    // Writer first, so the reader never sees a writer-less pipe
    let mut writer = registry
        .open("scullpipe0", &caller, OpenFlags::new(AccessMode::WriteOnly))
        .await?
        .into_pipe()
        .ok_or("scullpipe0 is not a pipe")?;
    let mut reader = registry
        .open("scullpipe0", &caller, OpenFlags::new(AccessMode::ReadOnly))
        .await?
        .into_pipe()
        .ok_or("scullpipe0 is not a pipe")?;

    reader.register_async_listener(Arc::new(|event: AsyncEvent| {
        eprintln!("[async] {} bytes available for {}", event.written, event.listener);
    }))?;

    let writer_task = tokio::spawn(async move {
        println!("Enter text (empty line to quit):");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }
            if let Err(e) = writer.write_all(trimmed.as_bytes()).await {
                eprintln!("Write error: {e}");
                break;
            }
        }

        writer.release();
        println!("Writer closed");
    });

    let reader_task = tokio::spawn(async move {
        read_all("r1", &mut reader).await;
    });

    let _ = tokio::join!(writer_task, reader_task);

    registry.shutdown();
    println!("All tasks completed");
    Ok(())
}

async fn read_all(name: &str, reader: &mut impl Read) {
    let mut buf = [0u8; 16];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                println!("({name}) EOF");
                break;
            }
            Ok(n) => {
                let data = String::from_utf8_lossy(&buf[..n]);
                println!("({name}): {data}");
            }
            Err(e) => {
                eprintln!("({name}) Error: {e:?}");
                break;
            }
        }
    }
}
