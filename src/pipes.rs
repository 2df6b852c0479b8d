use super::Result;

use crate::cli::Config;
use crate::fork::{exit_code, run_in_child, Gate};
use nix::unistd::{pipe, read, write};
use tracing::info;

/// Unidirectional byte-stream semantics of an anonymous pipe across a
/// fork boundary: byte-exact in-order delivery, and partial reads that
/// return whatever is currently buffered rather than blocking for the
/// full requested count.
pub fn run(_config: &Config) -> Result<()> {
    info!("pipes: partial-read semantics");

    let (rd, wr) = pipe()?;

    // Same-process round trip first: a write is immediately readable.
    check!(write(&wr, b"abcdef")? == 6);
    let mut buf = [0u8; 6];
    check!(read(&rd, &mut buf)? == 6);
    check!(&buf == b"abcdef");

    // Two writes separated by an explicit acknowledgment must surface as
    // two partial reads of exactly the buffered lengths, never as one
    // blocking read for the full request.
    let ack = Gate::new()?;
    let child = run_in_child(|| {
        let mut buf = [0u8; 6];
        check!(matches!(read(&rd, &mut buf), Ok(2)));
        check!(&buf[..2] == &b"ab"[..]);
        check!(ack.signal().is_ok());
        check!(matches!(read(&rd, &mut buf), Ok(4)));
        check!(&buf[..4] == &b"cdef"[..]);
        0
    })?;

    check!(write(&wr, b"ab")? == 2);
    // The second write may not land until the child has consumed the first.
    ack.wait()?;
    check!(write(&wr, b"cdef")? == 4);

    check!(exit_code(child)? == 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_bytes_and_order() {
        let (rd, wr) = pipe().unwrap();
        assert_eq!(write(&wr, b"xyz").unwrap(), 3);

        let mut buf = [0u8; 8];
        assert_eq!(read(&rd, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &b"xyz"[..]);
    }

    #[test]
    fn read_returns_only_the_buffered_bytes() {
        let (rd, wr) = pipe().unwrap();
        assert_eq!(write(&wr, b"ab").unwrap(), 2);

        // A request for more than is buffered must not block for the rest.
        let mut buf = [0u8; 6];
        assert_eq!(read(&rd, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &b"ab"[..]);
    }
}
