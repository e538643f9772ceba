//! 32-byte directory entry codec: short (8.3) entries, LFN entries, the
//! LFN checksum, short name generation and packed FAT timestamps.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};
use log::warn;

use crate::error::FilesystemError;

pub const DIR_ENTRY_SIZE: usize = 32;
pub const LFN_CHARS_PER_ENTRY: usize = 13;
/// Longest long name, in UTF-16 code units.
pub const MAX_LFN_LEN: usize = 255;

/// First name byte marking the end of a directory.
pub const ENTRY_END: u8 = 0x00;
/// First name byte marking a deleted / free slot.
pub const ENTRY_FREE: u8 = 0xE5;
/// Stored in place of a leading 0xE5 that is part of a real name.
const ENTRY_KANJI_E5: u8 = 0x05;
const LFN_LAST_ENTRY: u8 = 0x40;

pub const DOT_NAME: [u8; 11] = *b".          ";
pub const DOTDOT_NAME: [u8; 11] = *b"..         ";

bitflags! {
    /// Directory entry attribute byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        const LONG_NAME = 0x0F;
    }
}

bitflags! {
    /// NT reserved byte: lower-case hints for the short name halves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CaseFlags: u8 {
        const LOWER_BASE = 0x08;
        const LOWER_EXT = 0x10;
    }
}

impl Attributes {
    /// Exact LFN marker, as opposed to a short entry with those bits among others.
    pub fn is_long_name(&self) -> bool {
        self.bits() & 0x3F == Attributes::LONG_NAME.bits()
    }

    /// Compact `DRHSVA`-style rendering for long listings.
    pub fn flag_string(&self) -> String {
        [
            (Attributes::DIRECTORY, 'd'),
            (Attributes::READ_ONLY, 'r'),
            (Attributes::HIDDEN, 'h'),
            (Attributes::SYSTEM, 's'),
            (Attributes::ARCHIVE, 'a'),
        ]
        .iter()
        .map(|&(flag, c)| if self.contains(flag) { c } else { '-' })
        .collect()
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// A packed FAT date/time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FatTimestamp {
    pub date: u16,
    pub time: u16,
    /// Creation time fine resolution in 10 ms units (0..=199).
    pub tenth: u8,
}

impl FatTimestamp {
    /// Pack a wall-clock time. Years outside 1980..=2107 are clamped.
    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        let (year, month, day, hour, minute, second) = if dt.year() < 1980 {
            (1980, 1, 1, 0, 0, 0)
        } else if dt.year() > 2107 {
            (2107, 12, 31, 23, 59, 58)
        } else {
            (
                dt.year() as u32,
                dt.month(),
                dt.day(),
                dt.hour(),
                dt.minute(),
                dt.second().min(59),
            )
        };
        Self {
            date: (((year - 1980) << 9) | (month << 5) | day) as u16,
            time: ((hour << 11) | (minute << 5) | (second / 2)) as u16,
            tenth: ((second % 2) * 100) as u8,
        }
    }

    pub fn now() -> Self {
        Self::from_datetime(&Local::now().naive_local())
    }

    /// Unpack; `None` for a zero or out-of-range date.
    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        let year = ((self.date >> 9) & 0x7F) as i32 + 1980;
        let month = ((self.date >> 5) & 0x0F) as u32;
        let day = (self.date & 0x1F) as u32;
        let hour = ((self.time >> 11) & 0x1F) as u32;
        let minute = ((self.time >> 5) & 0x3F) as u32;
        let second = (self.time & 0x1F) as u32 * 2 + (self.tenth / 100) as u32;
        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
    }
}

/// Format a FAT date/time pair as "YYYY-MM-DD HH:MM:SS".
pub fn format_fat_datetime(date: u16, time: u16) -> String {
    if date == 0 {
        return String::new();
    }
    let day = date & 0x1F;
    let month = (date >> 5) & 0x0F;
    let year = ((date >> 9) & 0x7F) + 1980;
    let second = (time & 0x1F) * 2;
    let minute = (time >> 5) & 0x3F;
    let hour = (time >> 11) & 0x1F;
    format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
}

// ---------------------------------------------------------------------------
// Short entries
// ---------------------------------------------------------------------------

/// A decoded 8.3 directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortEntry {
    pub name: [u8; 11],
    pub attributes: Attributes,
    pub case: CaseFlags,
    pub created: FatTimestamp,
    pub access_date: u16,
    pub modified: FatTimestamp,
    pub first_cluster: u32,
    pub file_size: u32,
}

impl ShortEntry {
    /// New entry with all three timestamps set to `now`.
    pub fn new(
        name: [u8; 11],
        case: CaseFlags,
        attributes: Attributes,
        first_cluster: u32,
        now: FatTimestamp,
    ) -> Self {
        Self {
            name,
            attributes,
            case,
            created: now,
            access_date: now.date,
            modified: FatTimestamp { tenth: 0, ..now },
            first_cluster,
            file_size: 0,
        }
    }

    /// The `.` entry of a new directory.
    pub fn dot(cluster: u32, now: FatTimestamp) -> Self {
        Self::new(DOT_NAME, CaseFlags::empty(), Attributes::DIRECTORY, cluster, now)
    }

    /// The `..` entry of a new directory; `parent` is 0 when it is the root.
    pub fn dotdot(parent: u32, now: FatTimestamp) -> Self {
        Self::new(DOTDOT_NAME, CaseFlags::empty(), Attributes::DIRECTORY, parent, now)
    }

    pub fn parse(entry: &[u8]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&entry[0..11]);
        if name[0] == ENTRY_KANJI_E5 {
            name[0] = ENTRY_FREE;
        }
        let cluster_hi = LittleEndian::read_u16(&entry[20..22]) as u32;
        let cluster_lo = LittleEndian::read_u16(&entry[26..28]) as u32;
        Self {
            name,
            attributes: Attributes::from_bits_retain(entry[11]),
            case: CaseFlags::from_bits_truncate(entry[12]),
            created: FatTimestamp {
                tenth: entry[13],
                time: LittleEndian::read_u16(&entry[14..16]),
                date: LittleEndian::read_u16(&entry[16..18]),
            },
            access_date: LittleEndian::read_u16(&entry[18..20]),
            modified: FatTimestamp {
                tenth: 0,
                time: LittleEndian::read_u16(&entry[22..24]),
                date: LittleEndian::read_u16(&entry[24..26]),
            },
            first_cluster: (cluster_hi << 16) | cluster_lo,
            file_size: LittleEndian::read_u32(&entry[28..32]),
        }
    }

    pub fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut entry = [0u8; DIR_ENTRY_SIZE];
        entry[0..11].copy_from_slice(&self.name);
        if entry[0] == ENTRY_FREE {
            entry[0] = ENTRY_KANJI_E5;
        }
        entry[11] = self.attributes.bits();
        entry[12] = self.case.bits();
        entry[13] = self.created.tenth;
        LittleEndian::write_u16(&mut entry[14..16], self.created.time);
        LittleEndian::write_u16(&mut entry[16..18], self.created.date);
        LittleEndian::write_u16(&mut entry[18..20], self.access_date);
        LittleEndian::write_u16(&mut entry[20..22], (self.first_cluster >> 16) as u16);
        LittleEndian::write_u16(&mut entry[22..24], self.modified.time);
        LittleEndian::write_u16(&mut entry[24..26], self.modified.date);
        LittleEndian::write_u16(&mut entry[26..28], (self.first_cluster & 0xFFFF) as u16);
        LittleEndian::write_u32(&mut entry[28..32], self.file_size);
        entry
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes.contains(Attributes::VOLUME_ID)
    }

    pub fn is_dot_entry(&self) -> bool {
        self.name == DOT_NAME || self.name == DOTDOT_NAME
    }

    /// `NAME.EXT` with each half lower-cased when its case flag is set.
    pub fn display_name(&self) -> String {
        let mut base = decode_oem_string(&self.name[0..8]).trim_end().to_string();
        let mut ext = decode_oem_string(&self.name[8..11]).trim_end().to_string();
        if self.case.contains(CaseFlags::LOWER_BASE) {
            base = base.to_lowercase();
        }
        if self.case.contains(CaseFlags::LOWER_EXT) {
            ext = ext.to_lowercase();
        }
        if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        }
    }

    pub fn checksum(&self) -> u8 {
        lfn_checksum(&self.name)
    }
}

// ---------------------------------------------------------------------------
// LFN entries
// ---------------------------------------------------------------------------

/// One 13-character fragment of a long name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfnEntry {
    /// Sequence number, with 0x40 set on the highest one.
    pub ordinal: u8,
    pub chars: [u16; LFN_CHARS_PER_ENTRY],
    pub checksum: u8,
}

/// Byte offsets of the 13 UCS-2 code units within an LFN entry.
const LFN_CHAR_OFFSETS: [usize; LFN_CHARS_PER_ENTRY] =
    [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

impl LfnEntry {
    pub fn parse(entry: &[u8]) -> Self {
        let mut chars = [0u16; LFN_CHARS_PER_ENTRY];
        for (c, &off) in chars.iter_mut().zip(LFN_CHAR_OFFSETS.iter()) {
            *c = LittleEndian::read_u16(&entry[off..off + 2]);
        }
        Self {
            ordinal: entry[0],
            chars,
            checksum: entry[13],
        }
    }

    pub fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut entry = [0u8; DIR_ENTRY_SIZE];
        entry[0] = self.ordinal;
        for (&c, &off) in self.chars.iter().zip(LFN_CHAR_OFFSETS.iter()) {
            LittleEndian::write_u16(&mut entry[off..off + 2], c);
        }
        entry[11] = Attributes::LONG_NAME.bits();
        entry[12] = 0;
        entry[13] = self.checksum;
        // first cluster (bytes 26..28) stays zero
        entry
    }

    pub fn sequence(&self) -> u8 {
        self.ordinal & 0x3F
    }

    pub fn is_last(&self) -> bool {
        self.ordinal & LFN_LAST_ENTRY != 0
    }

    /// Code units of this fragment that belong to the name.
    pub fn name_units(&self) -> impl Iterator<Item = u16> + '_ {
        self.chars
            .iter()
            .copied()
            .take_while(|&c| c != 0x0000 && c != 0xFFFF)
    }
}

/// LFN checksum over the 11 raw short-name bytes.
pub fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    short_name
        .iter()
        .fold(0u8, |sum, &b| sum.rotate_right(1).wrapping_add(b))
}

/// Encode `name` as LFN entries in on-disk order: highest ordinal first,
/// ordinal 1 last (immediately before the short entry).
pub fn build_lfn_entries(name: &str, checksum: u8) -> Result<Vec<LfnEntry>, FilesystemError> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() || units.len() > MAX_LFN_LEN {
        return Err(FilesystemError::InvalidName(format!(
            "long name must be 1..={MAX_LFN_LEN} characters: {name:?}"
        )));
    }
    let count = units.len().div_ceil(LFN_CHARS_PER_ENTRY);
    let mut entries = Vec::with_capacity(count);
    for seq in (1..=count).rev() {
        let start = (seq - 1) * LFN_CHARS_PER_ENTRY;
        let mut chars = [0xFFFFu16; LFN_CHARS_PER_ENTRY];
        for (i, c) in chars.iter_mut().enumerate() {
            match units.get(start + i) {
                Some(&unit) => *c = unit,
                None => {
                    *c = 0x0000;
                    break;
                }
            }
        }
        let mut ordinal = seq as u8;
        if seq == count {
            ordinal |= LFN_LAST_ENTRY;
        }
        entries.push(LfnEntry {
            ordinal,
            chars,
            checksum,
        });
    }
    Ok(entries)
}

/// Collects LFN fragments while scanning a directory and pairs them with the
/// short entry that follows.
#[derive(Debug, Default)]
pub struct LfnAssembler {
    fragments: Vec<LfnEntry>,
    orphaned: bool,
}

impl LfnAssembler {
    pub fn push(&mut self, entry: LfnEntry) {
        if entry.is_last() {
            self.fragments.clear();
            self.orphaned = false;
        } else if self.fragments.is_empty() {
            self.orphaned = true;
        }
        self.fragments.push(entry);
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
        self.orphaned = false;
    }

    /// Long name for `short`, if the pending fragments form a complete group
    /// whose checksum matches. Pending fragments are consumed either way.
    pub fn take_name(&mut self, short: &ShortEntry) -> Option<String> {
        let fragments = std::mem::take(&mut self.fragments);
        let orphaned = std::mem::replace(&mut self.orphaned, false);
        if fragments.is_empty() {
            return None;
        }

        let count = fragments.len();
        let ordinals_ok = !orphaned
            && fragments
                .iter()
                .enumerate()
                .all(|(i, f)| f.sequence() as usize == count - i);
        if !ordinals_ok {
            warn!(
                "ignoring LFN group before {}: ordinals out of sequence",
                short.display_name()
            );
            return None;
        }

        let checksum = short.checksum();
        if fragments.iter().any(|f| f.checksum != checksum) {
            warn!(
                "ignoring LFN group before {}: checksum mismatch",
                short.display_name()
            );
            return None;
        }

        let units: Vec<u16> = fragments.iter().rev().flat_map(|f| f.name_units()).collect();
        Some(String::from_utf16_lossy(&units))
    }
}

/// One decoded 32-byte directory slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEntry {
    /// 0x00: no live entries follow.
    End,
    /// 0xE5: deleted, reusable.
    Free,
    Lfn(LfnEntry),
    Short(ShortEntry),
}

impl RawEntry {
    pub fn decode(entry: &[u8]) -> Self {
        match entry[0] {
            ENTRY_END => RawEntry::End,
            ENTRY_FREE => RawEntry::Free,
            _ if Attributes::from_bits_retain(entry[11]).is_long_name() => {
                RawEntry::Lfn(LfnEntry::parse(entry))
            }
            _ => RawEntry::Short(ShortEntry::parse(entry)),
        }
    }
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

const FORBIDDEN_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Reject names that can never be stored as a directory entry.
pub fn validate_name(name: &str) -> Result<(), FilesystemError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FilesystemError::InvalidName(format!("{name:?} is reserved")));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_control() || FORBIDDEN_CHARS.contains(c))
    {
        return Err(FilesystemError::InvalidName(format!(
            "{name:?} contains illegal character {c:?}"
        )));
    }
    if name.ends_with('.') || name.ends_with(' ') {
        return Err(FilesystemError::InvalidName(format!(
            "{name:?} ends with a dot or space"
        )));
    }
    if name.encode_utf16().count() > MAX_LFN_LEN {
        return Err(FilesystemError::InvalidName(format!(
            "name longer than {MAX_LFN_LEN} characters"
        )));
    }
    Ok(())
}

/// How a name is split into base and extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortNameKind {
    /// Whole name is the base; a dot forces a long name.
    Directory,
    /// Split at the last dot into base and up to three extension characters.
    File,
}

/// Result of short name generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortName {
    pub raw: [u8; 11],
    pub case: CaseFlags,
    /// Whether an LFN group must accompany the short entry.
    pub needs_lfn: bool,
}

pub(crate) fn is_legal_short_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'()-@^_`{}~".contains(c)
}

fn split_name(name: &str, kind: ShortNameKind) -> (&str, &str) {
    match kind {
        ShortNameKind::Directory => (name, ""),
        ShortNameKind::File => match name.rfind('.') {
            Some(pos) => (&name[..pos], &name[pos + 1..]),
            None => (name, ""),
        },
    }
}

/// Lower-case hint for one half: set only when the half has lower-case
/// letters and no upper-case ones.
fn is_uniformly_lower(part: &str) -> bool {
    part.chars().any(|c| c.is_ascii_lowercase()) && !part.chars().any(|c| c.is_ascii_uppercase())
}

fn pad_into(dst: &mut [u8], part: &str) {
    for (d, b) in dst.iter_mut().zip(part.bytes()) {
        *d = b.to_ascii_uppercase();
    }
}

/// Generate the 8.3 name for `name`.
///
/// Names of at most eight characters made only of legal 8.3 characters are
/// stored directly (upper-cased) without an LFN. Anything else gets a lossy
/// `BASE~N` tail where `N` is the smallest number not already used by one of
/// `existing` (raw short names of the target directory).
pub fn generate_short_name(
    name: &str,
    kind: ShortNameKind,
    existing: &[[u8; 11]],
) -> Result<ShortName, FilesystemError> {
    let (base, ext) = split_name(name, kind);
    let fits = name.chars().count() <= 8
        && !base.is_empty()
        && base.len() <= 8
        && ext.len() <= 3
        && base.chars().all(is_legal_short_char)
        && ext.chars().all(is_legal_short_char);

    if fits {
        let mut raw = [b' '; 11];
        pad_into(&mut raw[0..8], base);
        pad_into(&mut raw[8..11], ext);
        let mut case = CaseFlags::empty();
        if is_uniformly_lower(base) {
            case |= CaseFlags::LOWER_BASE;
        }
        if is_uniformly_lower(ext) {
            case |= CaseFlags::LOWER_EXT;
        }
        return Ok(ShortName {
            raw,
            case,
            needs_lfn: false,
        });
    }

    let lossy = |s: &str, max: usize| -> String {
        s.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .take(max)
            .collect()
    };
    let mut stem = lossy(base, 6);
    if stem.is_empty() {
        stem.push('_');
    }
    let ext = lossy(ext, 3);

    for n in 1..=999_999u32 {
        let tail = format!("~{n}");
        let keep = stem.len().min(8 - tail.len());
        let candidate_base = format!("{}{tail}", &stem[..keep]);
        let mut raw = [b' '; 11];
        pad_into(&mut raw[0..8], &candidate_base);
        pad_into(&mut raw[8..11], &ext);
        if !existing.contains(&raw) {
            return Ok(ShortName {
                raw,
                case: CaseFlags::empty(),
                needs_lfn: true,
            });
        }
    }
    Err(FilesystemError::InvalidName(format!(
        "no unique short name left for {name:?}"
    )))
}

// ---------------------------------------------------------------------------
// OEM code page
// ---------------------------------------------------------------------------

/// Decode a byte slice from OEM codepage (CP437) to a UTF-8 String.
///
/// Bytes 0x00-0x7F are ASCII. Bytes 0x80-0xFF are mapped using the standard
/// CP437 table used by DOS and FAT short filenames.
pub fn decode_oem_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| cp437_to_char(b)).collect()
}

fn cp437_to_char(b: u8) -> char {
    if b < 0x80 {
        b as char
    } else {
        CP437_HIGH[b as usize - 0x80]
    }
}

#[rustfmt::skip]
const CP437_HIGH: [char; 128] = [
    'Ç','ü','é','â','ä','à','å','ç', 'ê','ë','è','ï','î','ì','Ä','Å',
    'É','æ','Æ','ô','ö','ò','û','ù', 'ÿ','Ö','Ü','¢','£','¥','₧','ƒ',
    'á','í','ó','ú','ñ','Ñ','ª','º', '¿','⌐','¬','½','¼','¡','«','»',
    '░','▒','▓','│','┤','╡','╢','╖', '╕','╣','║','╗','╝','╜','╛','┐',
    '└','┴','┬','├','─','┼','╞','╟', '╚','╔','╩','╦','╠','═','╬','╧',
    '╨','╤','╥','╙','╘','╒','╓','╫', '╪','┘','┌','█','▄','▌','▐','▀',
    'α','ß','Γ','π','Σ','σ','µ','τ', 'Φ','Θ','Ω','δ','∞','φ','ε','∩',
    '≡','±','≥','≤','⌠','⌡','÷','≈', '°','∙','·','√','ⁿ','²','■','\u{00A0}',
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_with_case_flags() {
        let mut entry = ShortEntry::new(
            *b"README  TXT",
            CaseFlags::empty(),
            Attributes::ARCHIVE,
            0,
            FatTimestamp::default(),
        );
        assert_eq!(entry.display_name(), "README.TXT");
        entry.case = CaseFlags::LOWER_BASE;
        assert_eq!(entry.display_name(), "readme.TXT");
        entry.case = CaseFlags::LOWER_BASE | CaseFlags::LOWER_EXT;
        assert_eq!(entry.display_name(), "readme.txt");
        entry.name = *b"BOOTMGR    ";
        assert_eq!(entry.display_name(), "bootmgr");
    }

    #[test]
    fn test_display_name_cp437() {
        let entry = ShortEntry::new(
            *b"CAF\x82    TXT",
            CaseFlags::empty(),
            Attributes::empty(),
            0,
            FatTimestamp::default(),
        );
        assert_eq!(entry.display_name(), "CAFé.TXT");
    }

    #[test]
    fn test_short_entry_layout() {
        let ts = FatTimestamp {
            date: 0x5C3D,
            time: 0x7391,
            tenth: 100,
        };
        let mut entry = ShortEntry::new(
            *b"DOCUME~1   ",
            CaseFlags::empty(),
            Attributes::DIRECTORY,
            0x0012_3456,
            ts,
        );
        entry.file_size = 0xDEAD_BEEF;
        let bytes = entry.to_bytes();
        assert_eq!(&bytes[0..11], b"DOCUME~1   ");
        assert_eq!(bytes[11], 0x10);
        assert_eq!(bytes[13], 100);
        assert_eq!(LittleEndian::read_u16(&bytes[14..16]), 0x7391);
        assert_eq!(LittleEndian::read_u16(&bytes[16..18]), 0x5C3D);
        assert_eq!(LittleEndian::read_u16(&bytes[18..20]), 0x5C3D);
        assert_eq!(LittleEndian::read_u16(&bytes[20..22]), 0x0012);
        assert_eq!(LittleEndian::read_u16(&bytes[26..28]), 0x3456);
        assert_eq!(LittleEndian::read_u32(&bytes[28..32]), 0xDEAD_BEEF);
        assert_eq!(ShortEntry::parse(&bytes), entry);
    }

    #[test]
    fn test_leading_e5_escaped() {
        let entry = ShortEntry::new(
            *b"\xE5ABC    TXT",
            CaseFlags::empty(),
            Attributes::ARCHIVE,
            0,
            FatTimestamp::default(),
        );
        let bytes = entry.to_bytes();
        assert_eq!(bytes[0], 0x05);
        assert_eq!(RawEntry::decode(&bytes), RawEntry::Short(entry));
    }

    #[test]
    fn test_raw_entry_decode() {
        assert_eq!(RawEntry::decode(&[0u8; 32]), RawEntry::End);
        let mut free = [0x41u8; 32];
        free[0] = 0xE5;
        assert_eq!(RawEntry::decode(&free), RawEntry::Free);
        let lfn = build_lfn_entries("hello", 0x12).unwrap();
        assert!(matches!(RawEntry::decode(&lfn[0].to_bytes()), RawEntry::Lfn(_)));
    }

    #[test]
    fn test_lfn_checksum() {
        assert_eq!(lfn_checksum(b"A          "), 0x80);
        let name = *b"AVERYL~1TXT";
        let reference = name.iter().fold(0u8, |sum, &b| {
            (((sum & 1) << 7) | (sum >> 1)).wrapping_add(b)
        });
        assert_eq!(lfn_checksum(&name), reference);
    }

    #[test]
    fn test_build_lfn_entries_layout() {
        let name = "a_very_long_filename.txt";
        let entries = build_lfn_entries(name, 0x5A).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ordinal, 0x42);
        assert_eq!(entries[1].ordinal, 0x01);
        assert!(entries.iter().all(|e| e.checksum == 0x5A));

        // 24 units: 13 in entry 1, 11 in entry 2, then terminator and padding.
        assert_eq!(entries[0].chars[10], b't' as u16);
        assert_eq!(entries[0].chars[11], 0x0000);
        assert_eq!(entries[0].chars[12], 0xFFFF);

        let bytes = entries[1].to_bytes();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(LittleEndian::read_u16(&bytes[1..3]), b'a' as u16);
        assert_eq!(bytes[11], 0x0F);
        assert_eq!(bytes[12], 0);
        assert_eq!(bytes[13], 0x5A);
        assert_eq!(LittleEndian::read_u16(&bytes[26..28]), 0);
        assert_eq!(LittleEndian::read_u16(&bytes[28..30]), b'_' as u16);
        assert_eq!(LittleEndian::read_u16(&bytes[30..32]), b'f' as u16);
    }

    #[test]
    fn test_lfn_exact_multiple_has_no_terminator() {
        let entries = build_lfn_entries("abcdefghijklm", 1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].chars[12], b'm' as u16);
        assert!(!entries[0].chars.contains(&0x0000));
    }

    #[test]
    fn test_lfn_group_decode() {
        let name = "Quarterly Report (final) v2.docx";
        let short = ShortEntry::new(
            *b"QUARTE~1DOC",
            CaseFlags::empty(),
            Attributes::ARCHIVE,
            0,
            FatTimestamp::default(),
        );
        let mut assembler = LfnAssembler::default();
        for entry in build_lfn_entries(name, short.checksum()).unwrap() {
            let decoded = match RawEntry::decode(&entry.to_bytes()) {
                RawEntry::Lfn(lfn) => lfn,
                other => panic!("expected LFN, got {other:?}"),
            };
            assembler.push(decoded);
        }
        assert_eq!(assembler.take_name(&short).as_deref(), Some(name));
        assert_eq!(assembler.take_name(&short), None);
    }

    #[test]
    fn test_lfn_group_rejected_on_checksum_mismatch() {
        let short = ShortEntry::new(
            *b"LONGNA~1TXT",
            CaseFlags::empty(),
            Attributes::ARCHIVE,
            0,
            FatTimestamp::default(),
        );
        let mut assembler = LfnAssembler::default();
        for entry in build_lfn_entries("longname.txt", short.checksum() ^ 0xFF).unwrap() {
            assembler.push(entry);
        }
        assert_eq!(assembler.take_name(&short), None);
    }

    #[test]
    fn test_lfn_group_rejected_when_ordinal_missing() {
        let short = ShortEntry::new(
            *b"ABCDEF~1   ",
            CaseFlags::empty(),
            Attributes::ARCHIVE,
            0,
            FatTimestamp::default(),
        );
        let entries =
            build_lfn_entries("abcdefghijklmnopqrstuvwxyz0123", short.checksum()).unwrap();
        assert_eq!(entries.len(), 3);
        let mut assembler = LfnAssembler::default();
        assembler.push(entries[0].clone());
        assembler.push(entries[2].clone());
        assert_eq!(assembler.take_name(&short), None);

        // A fragment without a preceding last-entry marker is orphaned.
        assembler.push(entries[2].clone());
        assert_eq!(assembler.take_name(&short), None);
    }

    #[test]
    fn test_generate_plain_short_names() {
        let sn = generate_short_name("KERN.SYS", ShortNameKind::File, &[]).unwrap();
        assert!(!sn.needs_lfn);
        assert_eq!(&sn.raw, b"KERN    SYS");
        assert_eq!(sn.case, CaseFlags::empty());

        // Over eight characters in total, dot included, always takes a tail.
        let sn = generate_short_name("KERNEL.SYS", ShortNameKind::File, &[]).unwrap();
        assert!(sn.needs_lfn);
        assert_eq!(&sn.raw, b"KERNEL~1SYS");

        let sn = generate_short_name("a.txt", ShortNameKind::File, &[]).unwrap();
        assert_eq!(&sn.raw, b"A       TXT");
        assert_eq!(sn.case, CaseFlags::LOWER_BASE | CaseFlags::LOWER_EXT);

        let sn = generate_short_name("docs", ShortNameKind::Directory, &[]).unwrap();
        assert_eq!(&sn.raw, b"DOCS       ");
        assert_eq!(sn.case, CaseFlags::LOWER_BASE);
    }

    #[test]
    fn test_mixed_case_gets_no_case_flag() {
        let sn = generate_short_name("ReadMe", ShortNameKind::File, &[]).unwrap();
        assert!(!sn.needs_lfn);
        assert_eq!(&sn.raw, b"README     ");
        assert_eq!(sn.case, CaseFlags::empty());

        let sn = generate_short_name("notes.TXT", ShortNameKind::File, &[]).unwrap();
        assert!(sn.needs_lfn);
    }

    #[test]
    fn test_generate_tail_names() {
        let sn = generate_short_name("a_very_long_filename.txt", ShortNameKind::File, &[]).unwrap();
        assert!(sn.needs_lfn);
        assert_eq!(&sn.raw, b"AVERYL~1TXT");

        let existing = [*b"AVERYL~1TXT", *b"AVERYL~2TXT"];
        let sn = generate_short_name("a_very_long_filename2.txt", ShortNameKind::File, &existing)
            .unwrap();
        assert_eq!(&sn.raw, b"AVERYL~3TXT");

        let sn = generate_short_name("DOCUMENTS", ShortNameKind::Directory, &[]).unwrap();
        assert!(sn.needs_lfn);
        assert_eq!(&sn.raw, b"DOCUME~1   ");

        let sn = generate_short_name("v1.2", ShortNameKind::Directory, &[]).unwrap();
        assert!(sn.needs_lfn);
        assert_eq!(&sn.raw, b"V12~1      ");

        let sn = generate_short_name("my file", ShortNameKind::File, &[]).unwrap();
        assert!(sn.needs_lfn);
        assert_eq!(&sn.raw, b"MYFILE~1   ");
    }

    #[test]
    fn test_tail_shortens_stem_for_wide_counter() {
        let existing: Vec<[u8; 11]> = (1..=9)
            .map(|n| {
                let mut raw = [b' '; 11];
                raw[0..8].copy_from_slice(format!("LONGNA~{n}").as_bytes());
                raw
            })
            .collect();
        let sn = generate_short_name("longnamefile", ShortNameKind::File, &existing).unwrap();
        assert_eq!(&sn.raw[0..8], b"LONGN~10");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("DOCUMENTS").is_ok());
        assert!(validate_name("a_very_long_filename.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("what?").is_err());
        assert!(validate_name("trailing.").is_err());
        assert!(validate_name(&"x".repeat(256)).is_err());
        assert!(validate_name(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn test_timestamp_packing() {
        let dt = NaiveDate::from_ymd_opt(2026, 1, 29)
            .unwrap()
            .and_hms_opt(14, 30, 7)
            .unwrap();
        let ts = FatTimestamp::from_datetime(&dt);
        assert_eq!(ts.date, 29 | (1 << 5) | (46 << 9));
        assert_eq!(ts.time, 3 | (30 << 5) | (14 << 11));
        assert_eq!(ts.tenth, 100);
        assert_eq!(ts.to_datetime(), Some(dt));
        assert_eq!(format_fat_datetime(ts.date, ts.time), "2026-01-29 14:30:06");
    }

    #[test]
    fn test_timestamp_clamped_and_zero() {
        let dt = NaiveDate::from_ymd_opt(1975, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let ts = FatTimestamp::from_datetime(&dt);
        assert_eq!(ts.date, (1 << 5) | 1);
        assert_eq!(FatTimestamp::default().to_datetime(), None);
        assert_eq!(format_fat_datetime(0, 0), "");
    }

    #[test]
    fn test_attribute_helpers() {
        assert!(Attributes::from_bits_retain(0x0F).is_long_name());
        assert!(!Attributes::from_bits_retain(0x10).is_long_name());
        assert_eq!((Attributes::DIRECTORY | Attributes::HIDDEN).flag_string(), "d-h--");
    }
}
