//! Reference algorithm worker.
//!
//! Serves the command set in [`obscura::ipa::cmd`] over the channel endpoint
//! inherited at the reserved descriptor number. The worker is intentionally
//! trivial; it exists to exercise the proxy/transport/supervision path from
//! the other side of the trust boundary, the way a vendor module binary
//! would.

use obscura::error::Error;
use obscura::event::EventDispatcher;
use obscura::ipa::{cmd, inherited_channel};
use obscura::ipc::{IpcChannel, Payload};
use std::cell::Cell;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let dispatcher = match EventDispatcher::new() {
        Ok(d) => Rc::new(d),
        Err(e) => {
            tracing::error!(error = %e, "failed to create dispatcher");
            return ExitCode::FAILURE;
        }
    };

    // The channel endpoint must have been installed across exec by the
    // supervisor; running the worker standalone is a startup error.
    let channel = match inherited_channel(Rc::clone(&dispatcher)) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "no inherited channel endpoint");
            return ExitCode::FAILURE;
        }
    };

    let exit = Rc::new(Cell::new(None::<u8>));
    {
        let endpoint = channel.clone();
        let timers = Rc::clone(&dispatcher);
        let exit = Rc::clone(&exit);
        channel.set_ready_handler(move || {
            if let Some(code) = serve_one(&endpoint, &timers) {
                exit.set(Some(code));
            }
        });
    }

    loop {
        if let Some(code) = exit.get() {
            return ExitCode::from(code);
        }
        if let Err(e) = dispatcher.process_events() {
            tracing::error!(error = %e, "dispatcher failure");
            return ExitCode::FAILURE;
        }
    }
}

/// Handle one inbound message. Returns an exit code once the worker is done.
fn serve_one(channel: &IpcChannel, dispatcher: &Rc<EventDispatcher>) -> Option<u8> {
    let message = match channel.receive() {
        Ok(message) => message,
        // The core closed its end; a clean shutdown, not an error.
        Err(Error::Disconnected) => return Some(0),
        Err(e) => {
            tracing::error!(error = %e, "receive failed");
            return Some(1);
        }
    };

    let Some((&tag, rest)) = message.data.split_first() else {
        tracing::error!("message without a command tag");
        return Some(1);
    };

    let reply = match tag {
        cmd::EXIT => {
            let code = rest.first().copied().unwrap_or(0);
            tracing::debug!(code, "exit requested");
            return Some(code);
        }
        cmd::REVERSE => {
            // Echo the payload reversed and every descriptor back in order.
            let mut data = Vec::with_capacity(1 + rest.len());
            data.push(cmd::REVERSE);
            data.extend(rest.iter().rev());
            Payload {
                data,
                fds: message.fds,
            }
        }
        cmd::LEN_CALC => match total_length(&message.fds) {
            Ok(total) => {
                let mut data = Vec::with_capacity(1 + 8);
                data.push(cmd::LEN_CALC);
                data.extend_from_slice(&total.to_ne_bytes());
                Payload::from_data(data)
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot stat descriptor");
                return Some(1);
            }
        },
        cmd::CRASH => {
            tracing::debug!("crash requested");
            std::process::abort();
        }
        cmd::DELAY => {
            let units = rest.first().copied().unwrap_or(0) as u64;
            let mut data = Vec::with_capacity(rest.len());
            data.push(cmd::DELAY);
            data.extend_from_slice(rest.get(1..).unwrap_or(&[]));
            let reply = Payload {
                data,
                fds: message.fds,
            };
            let channel = channel.clone();
            dispatcher.schedule(Duration::from_millis(units * 10), move || {
                if let Err(e) = channel.send(&reply) {
                    tracing::error!(error = %e, "delayed reply failed");
                }
            });
            return None;
        }
        other => {
            tracing::error!(tag = other, "unknown command");
            return Some(1);
        }
    };

    if let Err(e) = channel.send(&reply) {
        tracing::error!(error = %e, "reply failed");
        return Some(1);
    }
    None
}

/// Sum the byte lengths of the files behind the given descriptors.
fn total_length(fds: &[std::os::fd::OwnedFd]) -> obscura::Result<u64> {
    let mut total = 0u64;
    for fd in fds {
        let stat = rustix::fs::fstat(fd)?;
        total += stat.st_size as u64;
    }
    Ok(total)
}
