//! Line-based operator console shared by the binaries.

use std::io::{BufRead, Write};

use tokio::sync::mpsc;

/// Prompt printed before each line.
pub const PROMPT: &str = "] ";

/// Forwards trimmed, non-empty lines from `input` to `tx`.
///
/// Blocking; run it on its own thread. Returns at end of input, on a read
/// error, or once the receiving side is gone.
pub fn forward_lines<R: BufRead, W: Write>(mut input: R, mut prompt: W, tx: mpsc::Sender<String>) {
    loop {
        let _ = write!(prompt, "{PROMPT}");
        let _ = prompt.flush();
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim();
        if !line.is_empty() && tx.blocking_send(line.to_string()).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn stops_at_end_of_input() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut prompt = Vec::new();
        forward_lines(Cursor::new("status\n\n  kick 2 \n"), &mut prompt, tx);

        assert_eq!(rx.try_recv().ok().as_deref(), Some("status"));
        assert_eq!(rx.try_recv().ok().as_deref(), Some("kick 2"));
        assert!(rx.try_recv().is_err());
        // One prompt per read, the last one hitting end of input.
        assert_eq!(prompt, PROMPT.repeat(4).into_bytes());
    }

    #[test]
    fn stops_when_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let mut prompt = Vec::new();
        forward_lines(Cursor::new("a\nb\nc\n"), &mut prompt, tx);
        assert_eq!(prompt, PROMPT.as_bytes());
    }
}
