use std::{env, io, time::Duration};

use roverlink::SessionBuilder;
use tracing_subscriber::EnvFilter;

const DEFAULT_HOST: &str = "127.0.0.1";
const PORT: u16 = 19479;
const RESPONSE_TIMEOUT_MS: u64 = 2_000;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let host = env::args().nth(1).unwrap_or_else(|| DEFAULT_HOST.to_string());
    let session = SessionBuilder::default().build().unwrap();
    session
        .connect(
            &host,
            PORT,
            Some(Duration::from_millis(RESPONSE_TIMEOUT_MS)),
        )
        .unwrap();
    println!("Binding to {}", session.local_addr().unwrap());

    // stdin
    loop {
        let mut text = String::new();
        if io::stdin().read_line(&mut text).unwrap() == 0 {
            break;
        }
        if text.ends_with('\n') {
            text.truncate(text.len() - 1);
        }

        let seq = match session.send(text.as_bytes(), None) {
            Ok(seq) => seq,
            Err(e) => {
                println!("err: send ({})", e);
                continue;
            }
        };
        match session.recv_response(seq) {
            Some(reply) => println!(
                "#{}: {}, {:X?}",
                seq,
                String::from_utf8_lossy(reply.data()),
                reply.data()
            ),
            None => println!("#{}: no reply (delivered: {})", seq, session.was_received(seq)),
        }
    }
    println!("{:?}", session.stat());
}
