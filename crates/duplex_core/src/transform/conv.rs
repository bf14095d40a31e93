//! `dd`-style byte conversions.
//!
//! The conversion tables come from GNU dd.

use crate::error::TransformError;
use crate::transform::{SlotBytes, Transform, TransformContext};

const NAME: &str = "conv";

const ASCII_TO_EBCDIC: [u8; 256] = [
    0x00, 0x01, 0x02, 0x03, 0x37, 0x2d, 0x2e, 0x2f,
    0x16, 0x05, 0x25, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    0x10, 0x11, 0x12, 0x13, 0x3c, 0x3d, 0x32, 0x26,
    0x18, 0x19, 0x3f, 0x27, 0x1c, 0x1d, 0x1e, 0x1f,
    0x40, 0x4f, 0x7f, 0x7b, 0x5b, 0x6c, 0x50, 0x7d,
    0x4d, 0x5d, 0x5c, 0x4e, 0x6b, 0x60, 0x4b, 0x61,
    0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7,
    0xf8, 0xf9, 0x7a, 0x5e, 0x4c, 0x7e, 0x6e, 0x6f,
    0x7c, 0xc1, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7,
    0xc8, 0xc9, 0xd1, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6,
    0xd7, 0xd8, 0xd9, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6,
    0xe7, 0xe8, 0xe9, 0x4a, 0xe0, 0x5a, 0x5f, 0x6d,
    0x79, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87,
    0x88, 0x89, 0x91, 0x92, 0x93, 0x94, 0x95, 0x96,
    0x97, 0x98, 0x99, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6,
    0xa7, 0xa8, 0xa9, 0xc0, 0x6a, 0xd0, 0xa1, 0x07,
    0x20, 0x21, 0x22, 0x23, 0x24, 0x15, 0x06, 0x17,
    0x28, 0x29, 0x2a, 0x2b, 0x2c, 0x09, 0x0a, 0x1b,
    0x30, 0x31, 0x1a, 0x33, 0x34, 0x35, 0x36, 0x08,
    0x38, 0x39, 0x3a, 0x3b, 0x04, 0x14, 0x3e, 0xe1,
    0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48,
    0x49, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57,
    0x58, 0x59, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67,
    0x68, 0x69, 0x70, 0x71, 0x72, 0x73, 0x74, 0x75,
    0x76, 0x77, 0x78, 0x80, 0x8a, 0x8b, 0x8c, 0x8d,
    0x8e, 0x8f, 0x90, 0x9a, 0x9b, 0x9c, 0x9d, 0x9e,
    0x9f, 0xa0, 0xaa, 0xab, 0xac, 0xad, 0xae, 0xaf,
    0xb0, 0xb1, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7,
    0xb8, 0xb9, 0xba, 0xbb, 0xbc, 0xbd, 0xbe, 0xbf,
    0xca, 0xcb, 0xcc, 0xcd, 0xce, 0xcf, 0xda, 0xdb,
    0xdc, 0xdd, 0xde, 0xdf, 0xea, 0xeb, 0xec, 0xed,
    0xee, 0xef, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff,
];

const ASCII_TO_IBM: [u8; 256] = [
    0x00, 0x01, 0x02, 0x03, 0x37, 0x2d, 0x2e, 0x2f,
    0x16, 0x05, 0x25, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    0x10, 0x11, 0x12, 0x13, 0x3c, 0x3d, 0x32, 0x26,
    0x18, 0x19, 0x3f, 0x27, 0x1c, 0x1d, 0x1e, 0x1f,
    0x40, 0x5a, 0x7f, 0x7b, 0x5b, 0x6c, 0x50, 0x7d,
    0x4d, 0x5d, 0x5c, 0x4e, 0x6b, 0x60, 0x4b, 0x61,
    0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7,
    0xf8, 0xf9, 0x7a, 0x5e, 0x4c, 0x7e, 0x6e, 0x6f,
    0x7c, 0xc1, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7,
    0xc8, 0xc9, 0xd1, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6,
    0xd7, 0xd8, 0xd9, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6,
    0xe7, 0xe8, 0xe9, 0xad, 0xe0, 0xbd, 0x5f, 0x6d,
    0x79, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87,
    0x88, 0x89, 0x91, 0x92, 0x93, 0x94, 0x95, 0x96,
    0x97, 0x98, 0x99, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6,
    0xa7, 0xa8, 0xa9, 0xc0, 0x4f, 0xd0, 0xa1, 0x07,
    0x20, 0x21, 0x22, 0x23, 0x24, 0x15, 0x06, 0x17,
    0x28, 0x29, 0x2a, 0x2b, 0x2c, 0x09, 0x0a, 0x1b,
    0x30, 0x31, 0x1a, 0x33, 0x34, 0x35, 0x36, 0x08,
    0x38, 0x39, 0x3a, 0x3b, 0x04, 0x14, 0x3e, 0xe1,
    0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48,
    0x49, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57,
    0x58, 0x59, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67,
    0x68, 0x69, 0x70, 0x71, 0x72, 0x73, 0x74, 0x75,
    0x76, 0x77, 0x78, 0x80, 0x8a, 0x8b, 0x8c, 0x8d,
    0x8e, 0x8f, 0x90, 0x9a, 0x9b, 0x9c, 0x9d, 0x9e,
    0x9f, 0xa0, 0xaa, 0xab, 0xac, 0xad, 0xae, 0xaf,
    0xb0, 0xb1, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7,
    0xb8, 0xb9, 0xba, 0xbb, 0xbc, 0xbd, 0xbe, 0xbf,
    0xca, 0xcb, 0xcc, 0xcd, 0xce, 0xcf, 0xda, 0xdb,
    0xdc, 0xdd, 0xde, 0xdf, 0xea, 0xeb, 0xec, 0xed,
    0xee, 0xef, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff,
];

const EBCDIC_TO_ASCII: [u8; 256] = [
    0x00, 0x01, 0x02, 0x03, 0x9c, 0x09, 0x86, 0x7f,
    0x97, 0x8d, 0x8e, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    0x10, 0x11, 0x12, 0x13, 0x9d, 0x85, 0x08, 0x87,
    0x18, 0x19, 0x92, 0x8f, 0x1c, 0x1d, 0x1e, 0x1f,
    0x80, 0x81, 0x82, 0x83, 0x84, 0x0a, 0x17, 0x1b,
    0x88, 0x89, 0x8a, 0x8b, 0x8c, 0x05, 0x06, 0x07,
    0x90, 0x91, 0x16, 0x93, 0x94, 0x95, 0x96, 0x04,
    0x98, 0x99, 0x9a, 0x9b, 0x14, 0x15, 0x9e, 0x1a,
    0x20, 0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6,
    0xa7, 0xa8, 0x5b, 0x2e, 0x3c, 0x28, 0x2b, 0x21,
    0x26, 0xa9, 0xaa, 0xab, 0xac, 0xad, 0xae, 0xaf,
    0xb0, 0xb1, 0x5d, 0x24, 0x2a, 0x29, 0x3b, 0x5e,
    0x2d, 0x2f, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7,
    0xb8, 0xb9, 0x7c, 0x2c, 0x25, 0x5f, 0x3e, 0x3f,
    0xba, 0xbb, 0xbc, 0xbd, 0xbe, 0xbf, 0xc0, 0xc1,
    0xc2, 0x60, 0x3a, 0x23, 0x40, 0x27, 0x3d, 0x22,
    0xc3, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67,
    0x68, 0x69, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9,
    0xca, 0x6a, 0x6b, 0x6c, 0x6d, 0x6e, 0x6f, 0x70,
    0x71, 0x72, 0xcb, 0xcc, 0xcd, 0xce, 0xcf, 0xd0,
    0xd1, 0x7e, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78,
    0x79, 0x7a, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7,
    0xd8, 0xd9, 0xda, 0xdb, 0xdc, 0xdd, 0xde, 0xdf,
    0xe0, 0xe1, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7,
    0x7b, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47,
    0x48, 0x49, 0xe8, 0xe9, 0xea, 0xeb, 0xec, 0xed,
    0x7d, 0x4a, 0x4b, 0x4c, 0x4d, 0x4e, 0x4f, 0x50,
    0x51, 0x52, 0xee, 0xef, 0xf0, 0xf1, 0xf2, 0xf3,
    0x5c, 0x9f, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58,
    0x59, 0x5a, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9,
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37,
    0x38, 0x39, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    AsciiToEbcdic,
    EbcdicToAscii,
    AsciiToIbm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Case {
    Upper,
    Lower,
}

/// Translates every byte through a 256-entry table built from the
/// configured flags.
#[derive(Debug, Clone)]
pub struct ConvTransform {
    conversion: Option<Conversion>,
    case: Option<Case>,
    table: [u8; 256],
    active: bool,
}

impl Default for ConvTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvTransform {
    pub fn new() -> Self {
        Self {
            conversion: None,
            case: None,
            table: identity(),
            active: false,
        }
    }

    fn set_conversion(&mut self, key: &str, conversion: Conversion) -> Result<(), TransformError> {
        match self.conversion {
            Some(current) if current != conversion => Err(TransformError::new(
                NAME,
                format!("{key} is not compatible with {}", conversion_key(current)),
            )),
            _ => {
                self.conversion = Some(conversion);
                Ok(())
            }
        }
    }

    fn set_case(&mut self, key: &str, case: Case) -> Result<(), TransformError> {
        match self.case {
            Some(current) if current != case => Err(TransformError::new(
                NAME,
                format!("{key} is not compatible with {}", case_key(current)),
            )),
            _ => {
                self.case = Some(case);
                Ok(())
            }
        }
    }

    fn build_table(&self) -> [u8; 256] {
        let mut table = identity();
        if self.conversion == Some(Conversion::EbcdicToAscii) {
            remap(&mut table, &EBCDIC_TO_ASCII);
        }
        match self.case {
            Some(Case::Upper) => table.iter_mut().for_each(|b| *b = b.to_ascii_uppercase()),
            Some(Case::Lower) => table.iter_mut().for_each(|b| *b = b.to_ascii_lowercase()),
            None => {}
        }
        match self.conversion {
            Some(Conversion::AsciiToEbcdic) => remap(&mut table, &ASCII_TO_EBCDIC),
            Some(Conversion::AsciiToIbm) => remap(&mut table, &ASCII_TO_IBM),
            _ => {}
        }
        table
    }
}

fn identity() -> [u8; 256] {
    let mut table = [0u8; 256];
    for (i, b) in table.iter_mut().enumerate() {
        *b = i as u8;
    }
    table
}

fn remap(table: &mut [u8; 256], through: &[u8; 256]) {
    for b in table.iter_mut() {
        *b = through[*b as usize];
    }
}

fn conversion_key(conversion: Conversion) -> &'static str {
    match conversion {
        Conversion::AsciiToEbcdic => "ascii-to-ebcdic",
        Conversion::EbcdicToAscii => "ebcdic-to-ascii",
        Conversion::AsciiToIbm => "ascii-to-ibm",
    }
}

fn case_key(case: Case) -> &'static str {
    match case {
        Case::Upper => "to-upper-case",
        Case::Lower => "to-lower-case",
    }
}

impl Transform for ConvTransform {
    fn name(&self) -> &str {
        NAME
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn accepts(&self, key: &str) -> bool {
        matches!(
            key,
            "to-upper-case" | "to-lower-case" | "ascii-to-ebcdic" | "ebcdic-to-ascii" | "ascii-to-ibm"
        )
    }

    fn configure(&mut self, key: &str, value: Option<&str>) -> Result<(), TransformError> {
        if value.is_some() {
            return Err(TransformError::new(NAME, format!("{key} does not take a value")));
        }
        match key {
            "to-upper-case" => self.set_case(key, Case::Upper)?,
            "to-lower-case" => self.set_case(key, Case::Lower)?,
            "ascii-to-ebcdic" => self.set_conversion(key, Conversion::AsciiToEbcdic)?,
            "ebcdic-to-ascii" => self.set_conversion(key, Conversion::EbcdicToAscii)?,
            "ascii-to-ibm" => self.set_conversion(key, Conversion::AsciiToIbm)?,
            _ => return Err(TransformError::new(NAME, format!("{key} is not a valid flag"))),
        }
        self.table = self.build_table();
        self.active = true;
        Ok(())
    }

    fn apply(&mut self, slot: &mut SlotBytes<'_>, _ctx: &TransformContext<'_>) -> Result<(), TransformError> {
        for b in slot.data_mut() {
            *b = self.table[*b as usize];
        }
        Ok(())
    }

    fn help(&self) -> &'static str {
        "   CONVERSIONS\n\
         \x20  to-lower-case     convert upper case characters to lower case\n\
         \x20  to-upper-case     convert lower case characters to upper case\n\
         \x20  ascii-to-ebcdic   from ASCII to EBCDIC\n\
         \x20  ebcdic-to-ascii   from EBCDIC to ASCII\n\
         \x20  ascii-to-ibm      from ASCII to alternate EBCDIC\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(transform: &mut ConvTransform, input: &[u8]) -> Vec<u8> {
        let mut storage = input.to_vec();
        let len = storage.len();
        let mut slot = SlotBytes::new(&mut storage, len);
        let ctx = TransformContext {
            start_offset: 0,
            is_last: false,
            ibs: 512,
            partitions: None,
        };
        transform.apply(&mut slot, &ctx).unwrap();
        slot.data().to_vec()
    }

    #[test]
    fn test_upper_case() {
        let mut conv = ConvTransform::new();
        conv.configure("to-upper-case", None).unwrap();
        assert_eq!(run(&mut conv, b"Hello, duplex!"), b"HELLO, DUPLEX!");
    }

    #[test]
    fn test_ebcdic_round_trip_of_letters() {
        let mut to_ebcdic = ConvTransform::new();
        to_ebcdic.configure("ascii-to-ebcdic", None).unwrap();
        let encoded = run(&mut to_ebcdic, b"AZaz09");
        assert_eq!(encoded, [0xC1, 0xE9, 0x81, 0xA9, 0xF0, 0xF9]);

        let mut to_ascii = ConvTransform::new();
        to_ascii.configure("ebcdic-to-ascii", None).unwrap();
        assert_eq!(run(&mut to_ascii, &encoded), b"AZaz09");
    }

    #[test]
    fn test_case_is_applied_before_encoding() {
        let mut conv = ConvTransform::new();
        conv.configure("ascii-to-ebcdic", None).unwrap();
        conv.configure("to-lower-case", None).unwrap();
        assert_eq!(run(&mut conv, b"A"), [0x81]);
    }

    #[test]
    fn test_incompatible_flags() {
        let mut conv = ConvTransform::new();
        conv.configure("to-upper-case", None).unwrap();
        assert!(conv.configure("to-lower-case", None).is_err());

        let mut conv = ConvTransform::new();
        conv.configure("ascii-to-ibm", None).unwrap();
        assert!(conv.configure("ebcdic-to-ascii", None).is_err());
        assert!(conv.configure("ascii-to-ibm", None).is_ok());
    }

    #[test]
    fn test_inactive_until_configured() {
        let conv = ConvTransform::new();
        assert!(!conv.is_active());
        assert!(conv.accepts("ascii-to-ibm"));
        assert!(!conv.accepts("compression"));
    }
}
