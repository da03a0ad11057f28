//! Printability Predicate
//!
//! Validation applied to every rune before it enters a post body. The
//! predicate accepts letters, digits, punctuation, symbols and regular
//! spaces; newline is the only permitted control character, and only
//! where multiline input is allowed.

use crate::shared::ProtocolError;

/// Check a single rune for printability
pub fn check_printable(r: char, multiline: bool) -> Result<(), ProtocolError> {
    match r {
        '\0' => Err(ProtocolError::ContainsNull),
        '\n' if multiline => Ok(()),
        // C0 and C1 control ranges, DEL
        c if (c as u32) < 0x20 || ((c as u32) >= 0x7f && (c as u32) <= 0x9f) => {
            Err(ProtocolError::NotPrintable(c as u32))
        }
        // Zero-width and directional override characters
        '\u{200b}' | '\u{200e}' | '\u{200f}' | '\u{202a}' | '\u{202b}' | '\u{202c}'
        | '\u{202d}' | '\u{202e}' | '\u{feff}' => Err(ProtocolError::NotPrintable(r as u32)),
        _ => Ok(()),
    }
}

/// Check every rune of a string for printability
pub fn check_printable_str(s: &str, multiline: bool) -> Result<(), ProtocolError> {
    for r in s.chars() {
        check_printable(r, multiline)?;
    }
    Ok(())
}
