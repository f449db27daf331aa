use std::{
    io::{self, Write},
    thread,
    time::Duration,
};

use miette::{miette, Context, IntoDiagnostic, Result};
use tidewatch::{
    clock, Buffer, CancelToken, Cancellable, Proxy, RawReader, RawWriter, TargetAddr, TcpEndpoint,
};
use tracing::{debug, info};

use crate::{cli::RelayArgs, configuration::Configuration};


const RELAY_CHUNK_BYTES: u64 = 8 * 1024;


pub fn relay_command(args: RelayArgs, configuration: &Configuration) -> Result<()> {
    info!(target = args.target, "Command: relay");

    let options = configuration.endpoint.to_endpoint_options();
    let target = TargetAddr::parse(&args.target)
        .into_diagnostic()
        .wrap_err_with(|| miette!("Failed to parse target address {}.", args.target))?;

    let proxy: Option<Proxy> = match (&configuration.proxy, args.no_proxy) {
        (Some(proxy_configuration), false) => Some(
            proxy_configuration
                .to_proxy()
                .wrap_err_with(|| miette!("Failed to assemble proxy from configuration."))?,
        ),
        _ => None,
    };

    let endpoint = match &proxy {
        Some(proxy) => TcpEndpoint::connect_via_proxy(proxy, &target, &options),
        None => TcpEndpoint::connect(&target, &options),
    }
    .into_diagnostic()
    .wrap_err_with(|| miette!("Failed to connect to {}.", args.target))?;

    debug!(
        peer = %endpoint.peer_addr().into_diagnostic()?,
        "Connection established."
    );

    let reader = endpoint.reader().into_diagnostic()?;
    let writer = endpoint.writer().into_diagnostic()?;

    let session_deadline = args.session_timeout_seconds.map(Duration::from_secs);

    // The socket-to-stdout direction runs on its own thread; stdin feeds
    // the socket from this one. Each pump gets a scope of its own (scopes
    // are thread-local) sharing the same session deadline.
    let downstream = thread::spawn(move || pump_to_stdout(reader, session_deadline));
    pump_from_stdin(writer, session_deadline)?;

    downstream
        .join()
        .map_err(|_| miette!("The downstream pump panicked."))??;

    debug!("Relay session finished.");
    Ok(())
}


fn apply_session_deadline(token: &CancelToken, session_deadline: Option<Duration>) {
    if let Some(limit) = session_deadline {
        token.set_deadline_nanos(clock::now_nanos() + limit.as_nanos() as i64);
    }
}

fn pump_from_stdin(mut writer: impl RawWriter, session_deadline: Option<Duration>) -> Result<()> {
    Cancellable::run_forever(|token| {
        apply_session_deadline(token, session_deadline);

        let mut stdin = io::stdin().lock();
        let mut staging = Buffer::new();

        loop {
            let read = staging
                .write_from_reader(&mut stdin, RELAY_CHUNK_BYTES)
                .into_diagnostic()
                .wrap_err_with(|| miette!("Failed to read from stdin."))?;
            if read == 0 {
                break;
            }

            let buffered = staging.size();
            writer
                .write_from(&mut staging, buffered)
                .into_diagnostic()
                .wrap_err_with(|| miette!("Failed to write to the endpoint."))?;
        }

        writer.flush().into_diagnostic()?;
        // Half-close so the peer observes end of input while the
        // downstream direction keeps draining.
        writer.close().into_diagnostic()?;

        Ok(())
    })
}

fn pump_to_stdout(mut reader: impl RawReader, session_deadline: Option<Duration>) -> Result<()> {
    Cancellable::run_forever(|token| {
        apply_session_deadline(token, session_deadline);

        let mut stdout = io::stdout().lock();
        let mut incoming = Buffer::new();

        loop {
            let read = reader
                .read_at_most_to(&mut incoming, RELAY_CHUNK_BYTES)
                .into_diagnostic()
                .wrap_err_with(|| miette!("Failed to read from the endpoint."))?;
            if read == 0 {
                break;
            }

            let bytes = incoming.read_to_vec(incoming.size() as usize);
            stdout
                .write_all(&bytes)
                .into_diagnostic()
                .wrap_err_with(|| miette!("Failed to write to stdout."))?;
            stdout.flush().into_diagnostic()?;
        }

        Ok(())
    })
}
