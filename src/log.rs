use bytes::BytesMut;
use tracing::debug;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

use crate::types::Phase;
use crate::unit::{ConfigureCode, OptionKind, OptionPack};

/// Install the fmt subscriber with `HH:MM:SS` local timestamps.
///
/// `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%H:%M:%S".to_string()))
        .with_target(false)
        .try_init();
}

pub fn hex_string(data: &[u8]) -> String {
    hex::encode_upper(data)
}

fn code_name(code: ConfigureCode) -> &'static str {
    match code {
        ConfigureCode::Request => "Configure-Request",
        ConfigureCode::Ack => "Configure-Ack",
        ConfigureCode::Nak => "Configure-Nak",
        ConfigureCode::Reject => "Configure-Reject",
    }
}

fn log_options<O: OptionKind>(
    direction: &str,
    marker: char,
    phase: Phase,
    code: ConfigureCode,
    id: u8,
    options: &OptionPack<O>,
) {
    if options.is_empty() {
        debug!("{} {} {} {}{} (no options)", direction, phase, code_name(code), marker, id);
        return;
    }
    for option in options.iter() {
        let mut value = BytesMut::with_capacity(option.value_len());
        option.write_value(&mut value);
        debug!(
            "{} {} {} {}{} Option={} Data={}",
            direction,
            phase,
            code_name(code),
            marker,
            id,
            option.option_type(),
            hex_string(&value)
        );
    }
}

/// Log each option of an outgoing Configure frame.
pub fn log_options_sent<O: OptionKind>(
    phase: Phase,
    code: ConfigureCode,
    id: u8,
    options: &OptionPack<O>,
) {
    log_options("Send", '#', phase, code, id, options);
}

/// Log each option of an incoming Configure frame.
pub fn log_options_received<O: OptionKind>(
    phase: Phase,
    code: ConfigureCode,
    id: u8,
    options: &OptionPack<O>,
) {
    log_options("Received", '*', phase, code, id, options);
}
