use bitfield_struct::bitfield;

/// Client command specifiers, the top 3 bits of the first data byte of a
/// request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    DownloadSegment = 0,
    InitiateDownload = 1,
    InitiateUpload = 2,
    UploadSegment = 3,
    BlockDownload = 6,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(UploadSegment),
            6 => Ok(BlockDownload),
            _ => Err(()),
        }
    }
}

/// Server command specifiers, the top 3 bits of the first data byte of a
/// response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    UploadSegment = 0,
    DownloadSegment = 1,
    InitiateUpload = 2,
    InitiateDownload = 3,
    Abort = 4,
    BlockDownload = 5,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(UploadSegment),
            1 => Ok(DownloadSegment),
            2 => Ok(InitiateUpload),
            3 => Ok(InitiateDownload),
            4 => Ok(Abort),
            5 => Ok(BlockDownload),
            _ => Err(()),
        }
    }
}

/// The command specifier carried by a frame's first data byte.
pub fn command_specifier(header: u8) -> u8 {
    header >> 5
}

/// Whether a payload travels inline with the initiate frame. The empty
/// payload does not: its fill count of 4 exceeds the 2-bit `n` field.
pub fn fits_expedited(len: usize) -> bool {
    (1..=4).contains(&len)
}

/// Composes a response header byte from the server command specifier and
/// the toggle bit.
pub fn server_response_byte(scs: ServerCommand, toggle: bool) -> u8 {
    ((scs as u8) << 5) | ((toggle as u8) << 4)
}

/// The header byte of an initiate frame. The same layout serves the
/// initiate-download request and the initiate-upload response.
#[bitfield(u8, order = Msb)]
pub struct SdoInitiateCmd {
    /// Command specifier.
    #[bits(3)]
    pub ccs: u8,

    #[bits(1)]
    _reserved_0: u8,

    /// Number of bytes of the 4-byte data field that do not contain data.
    /// Only meaningful when `e` and `s` are set.
    #[bits(2)]
    pub n: u8,

    /// Expedited transfer: the data travels inline with the initiate frame.
    #[bits(1)]
    pub e: bool,

    /// Size indicated: `n` (expedited) or bytes 4..8 (segmented) are valid.
    #[bits(1)]
    pub s: bool,
}

/// The header byte of a segment frame, in either direction.
#[bitfield(u8, order = Msb)]
pub struct SdoSegmentCmd {
    /// Command specifier.
    #[bits(3)]
    pub ccs: u8,

    /// Toggle bit, alternating between consecutive segments.
    #[bits(1)]
    pub t: u8,

    /// Number of bytes of the 7-byte segment field that do not contain data.
    #[bits(3)]
    pub n: u8,

    /// Set on the last segment of the transfer.
    #[bits(1)]
    pub c: bool,
}

/// The header byte of a block download initiate request.
#[bitfield(u8, order = Msb)]
pub struct SdoBlockInitiateCmd {
    /// Command specifier.
    #[bits(3)]
    pub ccs: u8,

    #[bits(2)]
    _reserved_0: u8,

    /// Client supports CRC over the whole block transfer.
    #[bits(1)]
    pub cc: bool,

    /// Size indicated: bytes 4..8 carry the total length.
    #[bits(1)]
    pub s: bool,

    /// Client subcommand (0 = initiate).
    #[bits(1)]
    pub cs: bool,
}

/// The header byte of a block download end request.
#[bitfield(u8, order = Msb)]
pub struct SdoEndBlockCmd {
    /// Command specifier.
    #[bits(3)]
    pub ccs: u8,

    /// Number of bytes of the last segment that do not contain data.
    #[bits(3)]
    pub n: u8,

    #[bits(1)]
    _reserved_0: bool,

    /// Client subcommand (1 = end).
    #[bits(1)]
    pub cs: bool,
}

/// The header byte of a block download response.
#[bitfield(u8, order = Msb)]
pub struct SdoBlockAckCmd {
    /// Command specifier.
    #[bits(3)]
    pub scs: u8,

    #[bits(3)]
    _reserved_0: u8,

    /// Server subcommand: 0 = initiate accepted, 2 = block acknowledged.
    /// Bit 0 alone acknowledges the end frame.
    #[bits(2)]
    pub ss: u8,
}
