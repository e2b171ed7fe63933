//! Fixed size packets flowing through the byte oriented end of both chains.

/// MPEG transport stream sync byte.
pub const MPEG_SYNC: u8 = 0x47;
/// Sync byte as inverted by the DVB-S energy dispersal on the first of every 8 packets.
pub const MPEG_SYNC_INV: u8 = MPEG_SYNC ^ 0xff;
/// XOR'd into the sync byte of a packet the Reed-Solomon decoder could not correct.
pub const MPEG_SYNC_CORRUPTED: u8 = 0x55;

pub const TS_PACKET_LEN: usize = 188;
pub const RS_PACKET_LEN: usize = 204;

/// Transport Error Indicator, most significant bit of the second header byte.
const TEI: u8 = 0x80;

/// A single 188 byte MPEG transport stream packet.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TsPacket(pub [u8; TS_PACKET_LEN]);

impl TsPacket {
    pub fn data(&self) -> &[u8] {
        &self.0
    }

    pub fn sync(&self) -> u8 {
        self.0[0]
    }

    /// Whether the Transport Error Indicator is set.
    pub fn tei(&self) -> bool {
        self.0[1] & TEI != 0
    }

    pub fn set_tei(&mut self) {
        self.0[1] |= TEI;
    }

    /// Packet identifier from the header.
    pub fn pid(&self) -> u16 {
        (u16::from(self.0[1] & 0x1f) << 8) | u16::from(self.0[2])
    }
}

impl Default for TsPacket {
    fn default() -> Self {
        Self([0u8; TS_PACKET_LEN])
    }
}

impl std::fmt::Debug for TsPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsPacket")
            .field("sync", &format_args!("{:#04x}", self.sync()))
            .field("pid", &self.pid())
            .field("tei", &self.tei())
            .finish()
    }
}

/// A DVB-S Reed-Solomon codeword, 188 data bytes followed by 16 parity bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RsPacket(pub [u8; RS_PACKET_LEN]);

impl Default for RsPacket {
    fn default() -> Self {
        Self([0u8; RS_PACKET_LEN])
    }
}

impl std::fmt::Debug for RsPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RsPacket({:#04x}, ..)", self.0[0])
    }
}
