//! Diagnostic trouble codes
//!
//! Standard two-byte DTC packing/unpacking plus a small knowledge base for
//! the codes that matter most on a tuned turbocharged DI engine.

/// How urgently a code needs attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational, no immediate action
    Advisory,
    /// Investigate before the next tuning session
    Caution,
    /// Stop tuning, reduce load targets immediately
    Critical,
}

/// Knowledge-base entry for a known trouble code
#[derive(Debug, Clone, Copy)]
pub struct DtcInfo {
    /// The code string, e.g. "P0234"
    pub code: &'static str,
    /// Human-readable description
    pub description: &'static str,
    /// Severity classification
    pub severity: Severity,
}

/// Known codes for this platform
const KNOWN_CODES: &[DtcInfo] = &[
    DtcInfo {
        code: "P0234",
        description: "Turbocharger overboost condition",
        severity: Severity::Critical,
    },
    DtcInfo {
        code: "P0087",
        description: "Fuel rail pressure too low",
        severity: Severity::Critical,
    },
    DtcInfo {
        code: "P0300",
        description: "Random/multiple cylinder misfire detected",
        severity: Severity::Critical,
    },
    DtcInfo {
        code: "P0299",
        description: "Turbocharger underboost condition",
        severity: Severity::Caution,
    },
    DtcInfo {
        code: "P0325",
        description: "Knock sensor circuit malfunction",
        severity: Severity::Caution,
    },
    DtcInfo {
        code: "P0420",
        description: "Catalyst efficiency below threshold",
        severity: Severity::Advisory,
    },
];

/// Look up a code in the knowledge base
pub fn lookup(code: &str) -> Option<&'static DtcInfo> {
    KNOWN_CODES.iter().find(|info| info.code == code)
}

/// Decode the standard two-byte DTC encoding into a code string.
///
/// The top two bits of the first byte select the system letter (P/C/B/U),
/// the remaining fourteen bits are four BCD-ish digits.
pub fn unpack(bytes: [u8; 2]) -> String {
    let letter = match bytes[0] >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    format!(
        "{}{}{:X}{:02X}",
        letter,
        (bytes[0] >> 4) & 0x03,
        bytes[0] & 0x0F,
        bytes[1]
    )
}

/// Encode a code string into the two-byte wire form.
///
/// Returns `None` for malformed codes.
pub fn pack(code: &str) -> Option<[u8; 2]> {
    let mut chars = code.chars();
    let letter = chars.next()?;
    let rest: String = chars.collect();
    if rest.len() != 4 || !rest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let letter_bits: u8 = match letter {
        'P' => 0,
        'C' => 1,
        'B' => 2,
        'U' => 3,
        _ => return None,
    };
    let d0 = rest[0..1].parse::<u8>().ok()?;
    if d0 > 3 {
        return None;
    }
    let d1 = u8::from_str_radix(&rest[1..2], 16).ok()?;
    let low = u8::from_str_radix(&rest[2..4], 16).ok()?;

    Some([(letter_bits << 6) | (d0 << 4) | d1, low])
}
