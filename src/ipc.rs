//! Control plane: a unix socket carrying one JSON request and one JSON
//! response per connection.

mod runtime;
mod server;

use anyhow::{Result, anyhow};
use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
};

pub use server::run_daemon;

pub fn client_request(req: serde_json::Value) -> Result<serde_json::Value> {
    let sock = runtime::socket_path()?;
    if !sock.exists() {
        return Err(anyhow!(
            "palmscroll daemon is not running (socket missing at {})",
            sock.display()
        ));
    }
    let mut stream = UnixStream::connect(sock)?;
    let line = serde_json::to_string(&req)? + "\n";
    stream.write_all(line.as_bytes())?;
    let mut reader = BufReader::new(stream);
    let mut resp = String::new();
    reader.read_line(&mut resp)?;
    let v: serde_json::Value = serde_json::from_str(&resp)?;
    Ok(v)
}
