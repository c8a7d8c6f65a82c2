//! Wire types and framing for the Splash controller/workstation/worker protocol.
//!
//! Every TCP connection carries a stream of `Message`s, each framed as a
//! 4-byte big-endian length prefix followed by that many bytes of a
//! `bincode`-encoded `Message`. This is the field-tagged binary encoding
//! the design calls out as "equivalent to protocol buffers" -- a tagged
//! enum plays the role a oneof would in a .proto file.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Bumped whenever a wire-incompatible change is made to `Message`.
pub const PROTOCOL_MAGIC: u32 = 0x5350_4C48; // "SPLH"
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest single frame we'll read. Build inputs/outputs can be large but
/// this bounds a malformed or hostile length prefix from causing an
/// unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024 * 1024; // 1 GiB

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    Developer,
    Build,
    Ui,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolchainKind {
    Gnu,
    Clang,
    Ise,
    Vivado,
    Yosys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Per-artifact-kind file affixes (e.g. object files are `.o` with no
/// prefix, shared libraries are `lib<name>.so`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactAffix {
    pub kind: String,
    pub prefix: String,
    pub suffix: String,
}

/// Wire representation of a worker-advertised toolchain. Controller-side
/// this is pure data -- no executable logic ever runs against it there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerInfo {
    pub hash: String,
    pub kind: ToolchainKind,
    pub version: VersionTriple,
    pub version_string: String,
    pub languages: Vec<String>,
    pub triplets: Vec<String>,
    pub compiler_names: Vec<String>,
    pub affixes: Vec<ArtifactAffix>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepEntry {
    pub fname: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentEntry {
    pub hash: String,
    /// True if the oid resolved to a READY entry; false means FAILED or
    /// missing (the latter should not happen for a hash the peer asked us
    /// to resolve, but is represented rather than assumed).
    pub found: bool,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkHashEntry {
    pub fname: String,
    pub found: bool,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeEntry {
    pub fname: String,
    pub hash: String,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAckEntry {
    pub fname: String,
    pub have_content: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutput {
    pub fname: String,
    pub hash: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResultEntry {
    pub fname: String,
    pub hash: String,
    pub log: String,
    pub ok: bool,
    pub sync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoKind {
    Arch,
    Client,
    Config,
    Node,
    Target,
    Toolchain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoEntry {
    pub hash: String,
    pub kind: String,
    pub arch: String,
    pub config: String,
    pub name: String,
    pub path: String,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfoEntry {
    pub hostname: String,
    pub uuid: Option<String>,
    pub client_type: ClientType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfoEntry {
    pub name: String,
    pub arch: String,
    pub config: String,
}

/// One frame on the wire. Every request carries exactly one terminal
/// response; `ContentRequestByHash`/`ContentResponse` and
/// `BulkHashRequest`/`BulkHashResponse` may interleave inside a primary
/// request's lifetime (see `DependencyScan`/`NodeBuildRequest` handling).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    ServerHello {
        magic: u32,
        version: u32,
    },
    ClientHello {
        magic: u32,
        version: u32,
        client_type: ClientType,
        hostname: String,
        uuid: Option<String>,
    },
    DevInfo {
        arch: String,
    },
    BuildInfo {
        cpu_count: u32,
        cpu_speed_mhz: u32,
        ram_mb: u64,
        num_chains: u32,
    },
    AddCompiler(CompilerInfo),

    DependencyScan {
        fname: String,
        arch: String,
        toolchain: String,
        flags: Vec<String>,
    },
    DependencyResults {
        ok: bool,
        stdout: String,
        deps: Vec<DepEntry>,
        libflags: Vec<String>,
    },

    ContentRequestByHash {
        oids: Vec<String>,
    },
    ContentResponse {
        entries: Vec<ContentEntry>,
    },

    BulkHashRequest {
        fnames: Vec<String>,
    },
    BulkHashResponse {
        files: Vec<BulkHashEntry>,
    },

    BulkFileChanged {
        entries: Vec<FileChangeEntry>,
    },
    BulkFileAck {
        entries: Vec<FileAckEntry>,
    },
    FileRemoved {
        fname: String,
    },

    NodeBuildRequest {
        node_hash: String,
        fname: String,
        toolchain: String,
        toolchain_hash: String,
        arch: String,
        flags: Vec<String>,
        sources: Vec<DepEntry>,
        stage: String,
    },
    NodeBuildResults {
        node_hash: String,
        success: bool,
        stdout: String,
        fname: String,
        outputs: Vec<BuildOutput>,
    },

    BuildRequest {
        target: String,
        arch: String,
        config: String,
        rebuild: bool,
    },
    BuildResults {
        status: bool,
        results: Vec<BuildResultEntry>,
    },

    InfoRequest {
        kind: InfoKind,
        query: Option<String>,
    },
    ArchList {
        arches: Vec<String>,
    },
    ClientList {
        clients: Vec<ClientInfoEntry>,
    },
    ConfigList {
        configs: Vec<String>,
    },
    NodeList {
        nodes: Vec<NodeInfoEntry>,
    },
    TargetList {
        targets: Vec<TargetInfoEntry>,
    },
    ToolchainList {
        toolchains: Vec<CompilerInfo>,
    },
}

#[derive(Debug)]
pub enum FramingError {
    Io(io::Error),
    FrameTooLarge(u32),
    Encode(bincode::Error),
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::Io(e) => write!(f, "i/o error: {}", e),
            FramingError::FrameTooLarge(n) => write!(f, "frame of {} bytes exceeds max frame length", n),
            FramingError::Encode(e) => write!(f, "encoding error: {}", e),
        }
    }
}
impl std::error::Error for FramingError {}
impl From<io::Error> for FramingError {
    fn from(e: io::Error) -> Self {
        FramingError::Io(e)
    }
}
impl From<bincode::Error> for FramingError {
    fn from(e: bincode::Error) -> Self {
        FramingError::Encode(e)
    }
}

/// Writes one length-prefixed, bincode-encoded message.
pub fn write_message<W: Write>(w: &mut W, msg: &Message) -> Result<(), FramingError> {
    let body = bincode::serialize(msg)?;
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(FramingError::FrameTooLarge(body.len() as u32));
    }
    w.write_u32::<BigEndian>(body.len() as u32)?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

/// Reads one length-prefixed, bincode-encoded message. Returns `Ok(None)`
/// on a clean EOF before any bytes of a new frame arrive (the normal way a
/// peer closes its write side between messages); any other failure --
/// including EOF mid-frame -- is an error and the caller should drop the
/// connection.
pub fn read_message<R: Read>(r: &mut R) -> Result<Option<Message>, FramingError> {
    let len = match r.read_u32::<BigEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(FramingError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    let msg = bincode::deserialize(&buf)?;
    Ok(Some(msg))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_a_byte_buffer() {
        let msg = Message::BuildRequest {
            target: "hello".into(),
            arch: "x86_64-linux-gnu".into(),
            config: "release".into(),
            rebuild: false,
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).unwrap();

        let mut cursor = io::Cursor::new(buf);
        let decoded = read_message(&mut cursor).unwrap().unwrap();
        match decoded {
            Message::BuildRequest { target, rebuild, .. } => {
                assert_eq!(target, "hello");
                assert!(!rebuild);
            }
            _ => panic!("wrong variant decoded"),
        }
    }

    #[test]
    fn clean_eof_between_frames_is_not_an_error() {
        let mut cursor = io::Cursor::new(Vec::<u8>::new());
        assert!(read_message(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected_before_allocating() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(MAX_FRAME_LEN + 1).unwrap();
        let mut cursor = io::Cursor::new(buf);
        match read_message(&mut cursor) {
            Err(FramingError::FrameTooLarge(_)) => {}
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }
}
