string_enum! {
    /// Encoding of an image object's pixel data. Text form is the DICOM UID.
    #[derive(Default)]
    pub enum TransferSyntax: "transfer syntax" {
        ImplicitVrLittleEndian => "1.2.840.10008.1.2",
        #[default]
        ExplicitVrLittleEndian => "1.2.840.10008.1.2.1",
        ExplicitVrBigEndian => "1.2.840.10008.1.2.2",
        RleLossless => "1.2.840.10008.1.2.5",
        JpegLossless => "1.2.840.10008.1.2.4.70",
        Jpeg2000Lossless => "1.2.840.10008.1.2.4.90",
        JpegBaseline => "1.2.840.10008.1.2.4.50",
        Jpeg2000Lossy => "1.2.840.10008.1.2.4.91",
    }
}

impl TransferSyntax {
    /// Pixel data is stored as compressed fragments rather than raw samples.
    pub fn encapsulated(&self) -> bool {
        matches!(
            self,
            TransferSyntax::RleLossless
                | TransferSyntax::JpegLossless
                | TransferSyntax::Jpeg2000Lossless
                | TransferSyntax::JpegBaseline
                | TransferSyntax::Jpeg2000Lossy
        )
    }

    pub fn lossy(&self) -> bool {
        matches!(
            self,
            TransferSyntax::JpegBaseline | TransferSyntax::Jpeg2000Lossy
        )
    }

    pub fn uid(&self) -> &'static str {
        self.as_str()
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransferSyntax::ImplicitVrLittleEndian => "Implicit VR Little Endian",
            TransferSyntax::ExplicitVrLittleEndian => "Explicit VR Little Endian",
            TransferSyntax::ExplicitVrBigEndian => "Explicit VR Big Endian",
            TransferSyntax::RleLossless => "RLE Lossless",
            TransferSyntax::JpegLossless => "JPEG Lossless",
            TransferSyntax::Jpeg2000Lossless => "JPEG 2000 Lossless",
            TransferSyntax::JpegBaseline => "JPEG Baseline",
            TransferSyntax::Jpeg2000Lossy => "JPEG 2000",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_round_trips_through_text_form() {
        let parsed: TransferSyntax = "1.2.840.10008.1.2.5".parse().unwrap();
        assert_eq!(parsed, TransferSyntax::RleLossless);
        assert!(parsed.encapsulated());
        assert!(!parsed.lossy());
        assert!("1.2.3".parse::<TransferSyntax>().is_err());
    }

    #[test]
    fn native_syntaxes_are_not_encapsulated() {
        assert!(!TransferSyntax::ExplicitVrLittleEndian.encapsulated());
        assert!(TransferSyntax::JpegBaseline.lossy());
    }
}
