use std::{sync::Arc, thread, time::Duration};

use roverlink::SessionBuilder;
use tracing_subscriber::EnvFilter;

const LISTEN_PORT: u16 = 19479;
const STAT_INTERVAL_S: u64 = 1;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let session = SessionBuilder::default().build().unwrap();
    let local = session.bind(LISTEN_PORT).unwrap();
    println!("listening on {}", local);
    let session = Arc::new(session);

    {
        let session = Arc::clone(&session);
        thread::spawn(move || stat_timer(&session));
    }

    loop {
        let Some(request) = session.receive(None) else {
            break;
        };
        println!(
            "{} #{}: {}, {:X?}",
            request.from(),
            request.seq(),
            String::from_utf8_lossy(request.data()),
            request.data()
        );
        if let Err(e) = session.send(request.data(), Some(&request)) {
            tracing::warn!("cannot echo #{}: {e}", request.seq());
        }
    }
}

fn stat_timer(session: &roverlink::Session) {
    let mut old_stat = None;
    loop {
        thread::sleep(Duration::from_secs(STAT_INTERVAL_S));
        let stat = session.stat();
        if old_stat.as_ref() != Some(&stat) {
            tracing::info!(?stat, "stat");
        }
        old_stat = Some(stat);
    }
}
