//! Mock backend for integration testing
//!
//! Environment variables:
//! - PORT: Port to listen on (required)
//! - MOCK_TAG: Text included in every greeting (default: empty)
//! - STARTUP_DELAY_MS: Delay before accepting connections (default: 0)
//!
//! Routes:
//! - /fail: 500 with a fixed body
//! - /crash: exits without answering
//! - /headers: the request headers, one per line
//! - anything else: 200 greeting

use std::env;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() {
    let port: u16 = env::var("PORT")
        .expect("PORT environment variable required")
        .parse()
        .expect("PORT must be a valid port number");

    let tag = env::var("MOCK_TAG").unwrap_or_default();

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);

    if startup_delay > 0 {
        println!("mock backend sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind");

    println!("mock backend listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let tag = tag.clone();
                tokio::spawn(async move {
                    handle_connection(stream, tag).await;
                });
            }
            Err(e) => {
                eprintln!("mock backend accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, tag: String) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    // Read HTTP request headers
    loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        buf.extend_from_slice(&temp[..n]);

        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return;
        }
    }

    let request_str = String::from_utf8_lossy(&buf).into_owned();
    let mut lines = request_str.lines();
    let request_line = lines.next().unwrap_or_default();

    let parts: Vec<&str> = request_line.split(' ').collect();
    let (method, path) = if parts.len() >= 2 {
        (parts[0], parts[1])
    } else {
        ("GET", "/")
    };

    println!("mock backend {} {}", method, path);

    let headers: Vec<&str> = lines.take_while(|l| !l.is_empty()).collect();

    let (status, body) = match path {
        "/crash" => {
            eprintln!("mock backend crashing");
            std::process::exit(1);
        }
        "/fail" => ("500 Internal Server Error", "mock backend failure".to_string()),
        "/headers" => ("200 OK", headers.join("\n").to_lowercase()),
        _ => ("200 OK", format!("hello from mock backend {}", tag)),
    };

    let body = if method == "HEAD" { String::new() } else { body };

    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         X-Mock-Backend: true\r\n\
         \r\n\
         {}",
        status,
        body.len(),
        body
    );

    let _ = stream.write_all(response.as_bytes()).await;
}
