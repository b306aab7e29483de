//! Console output to, and input from, the UART.
//!
//! Line buffering and the special editing characters belong to the
//! console device the file layer will expose; until then input is simply
//! echoed so a connected terminal feels alive.

use crate::uart;

pub fn init() {
    uart::init();
}

/// Sends one character to the UART.
///
/// Called by the print macros, and to echo input characters.
pub fn put_char(c: char) {
    let mut buf = [0; 4];
    for b in c.encode_utf8(&mut buf).bytes() {
        uart::putc_sync(b);
    }
}

/// Accepts one input character from the UART interrupt handler.
pub fn handle_input(c: u8) {
    match c {
        b'\r' => put_char('\n'),
        0x7f => {
            // delete: back up, overwrite with a space.
            put_char('\x08');
            put_char(' ');
            put_char('\x08');
        }
        _ => put_char(c as char),
    }
}
