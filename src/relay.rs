use std::io;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use log::*;

use crate::byte_stream::{ByteStream, ReadHalf, WriteHalf};
use crate::model::Error;
use crate::thread::{current_name, spawn_thread};

const BUFFER_SIZE: usize = 32 * 1024;

/// Last time bytes moved in either direction.
#[derive(Debug)]
struct Activity(Mutex<Instant>);

impl Activity {
    fn new() -> Self {
        Activity(Mutex::new(Instant::now()))
    }

    fn touch(&self) -> Result<(), Error> {
        *self.0.lock()? = Instant::now();
        Ok(())
    }

    fn idle(&self) -> Result<Duration, Error> {
        Ok(self.0.lock()?.elapsed())
    }
}

/// Pipe bytes between `a` and `b` in both directions until one of them stops.
///
/// * `a`
///    The endpoint carrying the idle timeout, typically the client facing connection.
/// * `b`
///    The other endpoint.
/// * `idle`
///    Maximum time without traffic in either direction. `None` disables it.
///
/// The first direction to finish ends the relay: both endpoints are closed,
/// the other direction is joined and its result is discarded.
/// End of stream counts as a normal finish.
pub fn relay<A, B>(a: &A, b: &B, idle: Option<Duration>) -> Result<(), Error>
where
    A: ByteStream + ?Sized,
    B: ByteStream + ?Sized,
{
    a.set_timeout(idle)?;
    let (read_a, write_a) = a.split()?;
    let (read_b, write_b) = b.split()?;
    let activity = Arc::new(Activity::new());
    let (tx, rx) = mpsc::channel();

    let outbound_th = {
        let tx = tx.clone();
        let activity = activity.clone();
        spawn_thread("outbound", move || {
            tx.send(pipe(read_a, write_b, idle, &activity)).ok();
        })?
    };
    let incoming_th = {
        let activity = activity.clone();
        spawn_thread("incoming", move || {
            tx.send(pipe(read_b, write_a, None, &activity)).ok();
        })?
    };

    let result = rx
        .recv()
        .unwrap_or_else(|_| Err(Error::disconnected("relay")));
    trace!("relay finished: {:?}", result);
    // unblock the other direction
    if let Err(err) = a.close() {
        debug!("close error: {}", err);
    }
    if let Err(err) = b.close() {
        debug!("close error: {}", err);
    }
    if outbound_th.join().is_err() {
        error!("relay panic: outbound");
    }
    if incoming_th.join().is_err() {
        error!("relay panic: incoming");
    }
    result
}

/// copy `src` into `dst` until end of stream or error
///
/// Read timeouts are only fatal when `idle` is set and nothing moved for that long.
fn pipe(
    mut src: ReadHalf,
    mut dst: WriteHalf,
    idle: Option<Duration>,
    activity: &Activity,
) -> Result<(), Error> {
    use io::ErrorKind as K;
    let name = current_name();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        match src.read(&mut buf) {
            Ok(0) => {
                debug!("{}: end of stream after {} bytes", name, total);
                dst.flush()?;
                return Ok(());
            }
            Ok(size) => {
                activity.touch()?;
                dst.write_all(&buf[..size])?;
                dst.flush()?;
                activity.touch()?;
                total += size as u64;
                trace!("{}: {} bytes", name, size);
            }
            Err(err) if err.kind() == K::Interrupted => {}
            Err(err) if err.kind() == K::WouldBlock || err.kind() == K::TimedOut => {
                if let Some(idle) = idle {
                    if activity.idle()? >= idle {
                        info!("{}: idle for {:?}", name, idle);
                        return Err(Error::IdleTimeout);
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}
