use std::{
    io,
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    thread,
    time::Instant,
};

use crate::{
    layer::{Accept, AckOutcome},
    protocol::frag::{ack_datagram, Fragment},
};

use super::{Counters, Link, Shared};

const RECV_BUF_LEN: usize = 1 << 16;

/// Drives the session until it shuts down.
///
/// Each turn waits for one datagram at most until the next retry is due,
/// handles it, then runs the retry and garbage collection passes.
pub(super) fn run(shared: Arc<Shared>) {
    let mut buf = vec![0; RECV_BUF_LEN];
    tracing::debug!("worker started");
    while shared.running.load(Ordering::Acquire) {
        let Some(link) = shared.link() else {
            thread::sleep(shared.config.max_poll);
            continue;
        };

        let wait = shared
            .outbound
            .lock()
            .next_wait(Instant::now(), shared.config.max_poll);
        if let Err(e) = link.socket.set_read_timeout(Some(wait)) {
            tracing::warn!("cannot set read timeout: {e}");
            thread::sleep(wait);
        }
        match link.socket.recv_from(&mut buf) {
            Ok((len, from)) => on_datagram(&shared, &link, &buf[..len], from),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => tracing::debug!("recv failed: {e}"),
        }

        let now = Instant::now();
        resend_due(&shared, &link, now);
        collect_garbage(&shared, now);
    }
    tracing::debug!("worker stopped");
}

fn on_datagram(shared: &Shared, link: &Arc<Link>, datagram: &[u8], from: SocketAddr) {
    // a datagram read just before `close` belongs to nobody
    if !shared
        .link()
        .is_some_and(|current| Arc::ptr_eq(&current, link))
    {
        return;
    }
    let now = Instant::now();
    let counters = &shared.counters;
    Counters::bump(&counters.datagrams_received);

    let frag = match Fragment::from_datagram(datagram) {
        Ok(frag) => frag,
        Err(e) => {
            Counters::bump(&counters.malformed);
            tracing::debug!(%from, "dropping datagram: {e}");
            return;
        }
    };
    let hdr = *frag.hdr();

    if !hdr.is_ack_only() {
        match link.send(&ack_datagram(&hdr), from) {
            Ok(_) => Counters::bump(&counters.acks_sent),
            Err(e) => {
                Counters::bump(&counters.send_errors);
                tracing::debug!(%from, seq = hdr.seq(), "cannot ack: {e}");
            }
        }
    }

    if hdr.resp_seq() != 0 {
        Counters::bump(&counters.acks_received);
        let outcome = shared.outbound.lock().on_ack(&hdr, from, now);
        match outcome {
            AckOutcome::Completed => tracing::trace!(seq = hdr.resp_seq(), "fully acked"),
            AckOutcome::ForeignSender => {
                tracing::debug!(%from, seq = hdr.resp_seq(), "ack from a stranger")
            }
            AckOutcome::NoSuchSend | AckOutcome::Partial => {}
        }
    }
    if hdr.is_ack_only() {
        return;
    }

    if shared.hosts.lock().seen_recently(from, hdr.seq(), now) {
        Counters::bump(&counters.duplicates);
        tracing::trace!(%from, seq = hdr.seq(), "duplicate");
        return;
    }

    let accepted = shared.reassembly.lock().accept(from, frag, now);
    let inbound = match accepted {
        Accept::Complete(inbound) => inbound,
        Accept::Incomplete => return,
        Accept::Dropped(reason) => {
            Counters::bump(&counters.malformed);
            tracing::warn!(
                %from,
                seq = hdr.seq(),
                offset = hdr.offset(),
                total_len = hdr.total_len(),
                "dropping fragment: {reason:?}"
            );
            return;
        }
    };
    shared.hosts.lock().record_complete(from, hdr.seq(), now);
    Counters::bump(&counters.msgs_delivered);
    tracing::trace!(%from, seq = hdr.seq(), resp_seq = inbound.resp_seq, "completed");

    if inbound.resp_seq == 0 {
        let mut unsolicited = shared.unsolicited.lock();
        unsolicited.push_back(inbound);
        shared.unsolicited_cv.notify_one();
    } else {
        shared.responses.lock().deliver(inbound);
    }
}

fn resend_due(shared: &Shared, link: &Link, now: Instant) {
    let due = shared.outbound.lock().due_retries(now);
    for retransmission in due {
        for datagram in &retransmission.datagrams {
            match link.send(datagram, retransmission.dest) {
                Ok(_) => Counters::bump(&shared.counters.retransmissions),
                Err(e) => {
                    Counters::bump(&shared.counters.send_errors);
                    tracing::debug!(seq = retransmission.seq, "resend failed: {e}");
                }
            }
        }
        tracing::trace!(
            seq = retransmission.seq,
            frags = retransmission.datagrams.len(),
            "resent"
        );
    }
}

fn collect_garbage(shared: &Shared, now: Instant) {
    let counters = &shared.counters;

    let expired = shared.outbound.lock().expire(now);
    for seq in &expired {
        tracing::debug!(seq, "gave up on unacked message");
    }
    Counters::add(&counters.expired_sends, expired.len() as u64);

    let stalled = shared.reassembly.lock().expire(now);
    if stalled != 0 {
        tracing::debug!(stalled, "dropped incomplete messages");
    }

    let expiry = shared.config.inbound_expiry;
    let is_fresh = |completed_at: Instant| now.saturating_duration_since(completed_at) <= expiry;
    let mut unclaimed = 0;
    {
        let mut unsolicited = shared.unsolicited.lock();
        let before = unsolicited.len();
        unsolicited.retain(|x| is_fresh(x.completed_at));
        unclaimed += before - unsolicited.len();
    }
    {
        let mut responses = shared.responses.lock();
        let before = responses.ready.len();
        responses.ready.retain(|x| is_fresh(x.completed_at));
        unclaimed += before - responses.ready.len();
    }
    if unclaimed != 0 {
        tracing::debug!(unclaimed, "dropped unclaimed messages");
    }
    Counters::add(&counters.expired_inbound, (stalled + unclaimed) as u64);

    shared.hosts.lock().sweep(now);
}
