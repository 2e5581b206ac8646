//! Informal description of the wire formats and their limits.

// Keystream exchange, sent once by the initiator before any payload:
// ```text
// | len | password  |
// |  1B | len bytes |
// ```
// `password` is a derangement of `0..len`. The single length byte caps `len`
// at 255.
pub(crate) const PASSWORD_MIN_LEN: usize = 128;
pub(crate) const PASSWORD_MAX_LEN: usize = 255;

// Disguise tunnel, a subset of the RESP text protocol:
// ```text
// initiator                          responder
// PING\r\n                      ->
//                               <-   +PONG\r\n
// SET <key> <base64>\r\n        ->
//                               <-   +OK\r\n
// GET <key>\r\n                 ->
//                               <-   $<len>\r\n<base64>\r\n   data
//                               <-   $0\r\n\r\n               nothing yet
//                               <-   $-1\r\n                  writer finished
// SET <key> ""\r\n              ->                             upload finished
//                               <-   +OK\r\n
// QUIT\r\n                      ->
//                               <-   +OK\r\n
// ```
// `<key>` is random and ignored by both sides. Malformed commands get
// `-ERR <message>\r\n` and do not end the session.
pub(crate) const KEY_LEN: usize = 5;

/// Largest payload carried by one `SET` or one `GET` reply, before base64.
pub(crate) const MAX_CHUNK_LEN: usize = 48 * 1024;

/// Longest line or bulk argument accepted from the peer.
pub(crate) const MAX_LINE_LEN: usize = 4 * MAX_CHUNK_LEN;

/// Maximum number of arguments in one multibulk command.
pub(crate) const MAX_ARGS: usize = 16;
