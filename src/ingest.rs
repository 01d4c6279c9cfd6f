//! Feeding the head of a pipeline from an external text source.

use crate::error::Result;
use crate::queue::BoundedQueue;
use std::io::BufRead;

/// Parse an integer from the ASCII digits in `token`, ignoring everything
/// else. Signs are not digits, so `"-1"` reads as 1. Tokens without digits,
/// or with more digits than fit in an `i32`, read as 0.
pub fn parse_digits(token: &str) -> i32 {
    let digits: String = token.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// Push every whitespace-separated token from `reader` into `queue`.
///
/// Tokens for which `parse` returns `None` are skipped with a warning.
/// Returns the number of elements pushed. Stops early, without error, if
/// the queue's write side has been interrupted.
pub fn ingest_tokens<R, T, P>(reader: R, queue: &BoundedQueue<T>, mut parse: P) -> Result<u64>
where
    R: BufRead,
    T: Send,
    P: FnMut(&str) -> Option<T>,
{
    let mut pushed = 0u64;
    for line in reader.lines() {
        let line = line?;
        for token in line.split_whitespace() {
            let Some(value) = parse(token) else {
                tracing::warn!(token, "skipping unparsable input");
                continue;
            };
            if queue.push_one(value).is_err() {
                tracing::info!(pushed, "input queue closed, stopping ingestion");
                return Ok(pushed);
            }
            pushed += 1;
        }
    }
    tracing::debug!(pushed, "input exhausted");
    Ok(pushed)
}
