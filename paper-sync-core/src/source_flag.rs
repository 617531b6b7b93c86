//! Decoding of the legacy source-type code and the source format tables.
//!
//! The legacy metadata carries a short code such as `"1D"` or `"AS"` where each
//! character switches on one independent capability of the submission.

use std::fmt;

/// One named capability carried by a source-type code character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `I`: withdrawn, every file auto-ignored.
    Ignore,
    /// `S`: source is encrypted and must not be served.
    Encrypted,
    /// `P`: multi-file PostScript submission.
    PsOnly,
    /// `D`: TeX that must be processed with pdflatex.
    PdfLatex,
    /// `H`: multi-file HTML submission.
    Html,
    /// `A`: ancillary files under `/anc`.
    AncillaryFiles,
    /// `B`: data held in the DC pilot system.
    PilotData,
    /// `X`: Office Open XML (docx).
    Docx,
    /// `O`: Open Document Format.
    Odf,
    /// `F`: PDF-only submission shipped as a `.tar.gz` (usually for ancillary files).
    PdfOnlyWithTar,
    /// `1`: the source is a single file.
    SingleFile,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::Ignore,
        Capability::Encrypted,
        Capability::PsOnly,
        Capability::PdfLatex,
        Capability::Html,
        Capability::AncillaryFiles,
        Capability::PilotData,
        Capability::Docx,
        Capability::Odf,
        Capability::PdfOnlyWithTar,
        Capability::SingleFile,
    ];

    pub fn code(self) -> char {
        match self {
            Capability::Ignore => 'I',
            Capability::Encrypted => 'S',
            Capability::PsOnly => 'P',
            Capability::PdfLatex => 'D',
            Capability::Html => 'H',
            Capability::AncillaryFiles => 'A',
            Capability::PilotData => 'B',
            Capability::Docx => 'X',
            Capability::Odf => 'O',
            Capability::PdfOnlyWithTar => 'F',
            Capability::SingleFile => '1',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Capability::ALL.into_iter().find(|cap| cap.code() == c)
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Capability set decoded from a source-type code.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SourceFlag {
    bits: u16,
}

impl SourceFlag {
    /// Decodes a code string. Characters that name no capability are ignored.
    pub fn from_code(code: &str) -> Self {
        let mut flag = SourceFlag::default();
        for cap in code.chars().filter_map(Capability::from_code) {
            flag.insert(cap);
        }
        flag
    }

    pub fn insert(&mut self, cap: Capability) {
        self.bits |= cap.bit();
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.bits & cap.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|cap| self.contains(*cap))
    }

    pub fn ignore(&self) -> bool {
        self.contains(Capability::Ignore)
    }

    pub fn encrypted(&self) -> bool {
        self.contains(Capability::Encrypted)
    }

    pub fn ps_only(&self) -> bool {
        self.contains(Capability::PsOnly)
    }

    pub fn pdflatex(&self) -> bool {
        self.contains(Capability::PdfLatex)
    }

    pub fn html(&self) -> bool {
        self.contains(Capability::Html)
    }

    pub fn includes_ancillary_files(&self) -> bool {
        self.contains(Capability::AncillaryFiles)
    }

    pub fn pilot_data(&self) -> bool {
        self.contains(Capability::PilotData)
    }

    pub fn docx(&self) -> bool {
        self.contains(Capability::Docx)
    }

    pub fn odf(&self) -> bool {
        self.contains(Capability::Odf)
    }

    pub fn pdf_only(&self) -> bool {
        self.contains(Capability::PdfOnlyWithTar)
    }

    pub fn single_file(&self) -> bool {
        self.contains(Capability::SingleFile)
    }

    /// True when this version cannot produce a PDF. Withdrawal is not considered.
    pub fn cannot_pdf(&self) -> bool {
        self.html() || self.odf() || self.docx()
    }
}

impl fmt::Display for SourceFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for cap in self.iter() {
            write!(f, "{}", cap.code())?;
        }
        Ok(())
    }
}

impl fmt::Debug for SourceFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceFlag({self})")
    }
}

/// Source format of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    Tex,
    PdfTex,
    Html,
    Ps,
    Pdf,
    Docx,
    Odf,
    Withdrawn,
}

impl SourceFormat {
    /// Parses the name used in publish events. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "tex" => Some(SourceFormat::Tex),
            "pdftex" => Some(SourceFormat::PdfTex),
            "html" => Some(SourceFormat::Html),
            "ps" => Some(SourceFormat::Ps),
            "pdf" => Some(SourceFormat::Pdf),
            "docx" => Some(SourceFormat::Docx),
            "odf" => Some(SourceFormat::Odf),
            "withdrawn" => Some(SourceFormat::Withdrawn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceFormat::Tex => "tex",
            SourceFormat::PdfTex => "pdftex",
            SourceFormat::Html => "html",
            SourceFormat::Ps => "ps",
            SourceFormat::Pdf => "pdf",
            SourceFormat::Docx => "docx",
            SourceFormat::Odf => "odf",
            SourceFormat::Withdrawn => "withdrawn",
        }
    }

    /// Format named by a single source-type code character, for the characters that name one.
    pub fn from_flag_char(c: char) -> Option<Self> {
        match c {
            'D' => Some(SourceFormat::PdfTex),
            'H' => Some(SourceFormat::Html),
            'I' => Some(SourceFormat::Withdrawn),
            'O' => Some(SourceFormat::Odf),
            'P' => Some(SourceFormat::Ps),
            'X' => Some(SourceFormat::Docx),
            _ => None,
        }
    }

    /// Format implied by a source file extension.
    ///
    /// `.gz` is a single TeX file that may or may not need pdflatex; `hint`
    /// (what the metadata said) settles it, plain `tex` otherwise.
    pub fn from_extension(src_ext: &str, hint: Option<SourceFormat>) -> Self {
        match src_ext {
            ".html.gz" => SourceFormat::Html,
            ".ps.gz" => SourceFormat::Ps,
            ".pdf" => SourceFormat::Pdf,
            ".gz" => match hint {
                Some(SourceFormat::PdfTex) => SourceFormat::PdfTex,
                _ => SourceFormat::Tex,
            },
            _ => SourceFormat::Tex,
        }
    }

    pub fn is_tex_family(self) -> bool {
        matches!(self, SourceFormat::Tex | SourceFormat::PdfTex)
    }

    pub fn is_html_family(self) -> bool {
        self == SourceFormat::Html
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_character_membership() {
        let flag = SourceFlag::from_code("1DA");
        assert!(flag.single_file());
        assert!(flag.pdflatex());
        assert!(flag.includes_ancillary_files());
        assert!(!flag.html());
        assert!(!flag.encrypted());
        assert_eq!(flag.to_string(), "DA1");
    }

    #[test]
    fn unknown_characters_are_ignored() {
        let flag = SourceFlag::from_code("zq");
        assert!(flag.is_empty());
    }

    #[test]
    fn cannot_pdf_follows_html_odf_docx() {
        assert!(SourceFlag::from_code("H").cannot_pdf());
        assert!(SourceFlag::from_code("O").cannot_pdf());
        assert!(SourceFlag::from_code("X").cannot_pdf());
        assert!(!SourceFlag::from_code("DSA").cannot_pdf());
        assert!(!SourceFlag::from_code("I").cannot_pdf());
    }

    #[test]
    fn every_capability_round_trips_its_code() {
        for cap in Capability::ALL {
            assert_eq!(Capability::from_code(cap.code()), Some(cap));
        }
    }

    #[test]
    fn gz_extension_uses_the_hint() {
        assert_eq!(
            SourceFormat::from_extension(".gz", Some(SourceFormat::PdfTex)),
            SourceFormat::PdfTex
        );
        assert_eq!(SourceFormat::from_extension(".gz", None), SourceFormat::Tex);
        assert_eq!(
            SourceFormat::from_extension(".gz", Some(SourceFormat::Ps)),
            SourceFormat::Tex
        );
        assert_eq!(SourceFormat::from_extension(".pdf", None), SourceFormat::Pdf);
        assert_eq!(
            SourceFormat::from_extension(".html.gz", None),
            SourceFormat::Html
        );
        assert_eq!(SourceFormat::from_extension(".tar.gz", None), SourceFormat::Tex);
    }
}
