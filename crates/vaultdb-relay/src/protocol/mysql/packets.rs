//! MySQL packet structures
//!
//! Wire structures for the connection phase.
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html>

/// MySQL packet header (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes)
    pub payload_length: u32,
    /// Sequence ID
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Maximum payload size of a single packet (2^24 - 1)
    pub const MAX_PAYLOAD_LENGTH: u32 = 0xFF_FF_FF;

    pub fn new(payload_length: u32, sequence_id: u8) -> Self {
        Self {
            payload_length,
            sequence_id,
        }
    }

    /// Encode as the 4 header bytes.
    pub fn to_bytes(self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }

    /// Decode from the 4 header bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self::new(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            bytes[3],
        )
    }
}

/// MySQL Handshake V10 packet (server -> client)
/// Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_packets_protocol_handshake_v10.html>
#[derive(Debug, Clone)]
pub struct HandshakeV10 {
    /// Protocol version (always 10)
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Auth plugin data (scramble), both parts joined
    pub auth_plugin_data: Vec<u8>,
    /// Full 32-bit capability flags
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    /// Auth plugin name (if CLIENT_PLUGIN_AUTH)
    pub auth_plugin_name: String,
}

impl Default for HandshakeV10 {
    fn default() -> Self {
        Self {
            protocol_version: 10,
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            connection_id: 1,
            auth_plugin_data: vec![0u8; SCRAMBLE_LENGTH],
            capability_flags: DEFAULT_SERVER_CAPABILITIES,
            character_set: DEFAULT_COLLATION_ID,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: MYSQL_NATIVE_PASSWORD.to_string(),
        }
    }
}

impl HandshakeV10 {
    /// The 20-byte scramble used by the password plugins.
    pub fn scramble(&self) -> &[u8] {
        let len = self.auth_plugin_data.len().min(SCRAMBLE_LENGTH);
        &self.auth_plugin_data[..len]
    }

    /// Plugin the server wants, defaulting to native password.
    pub fn auth_plugin(&self) -> &str {
        if self.auth_plugin_name.is_empty() {
            MYSQL_NATIVE_PASSWORD
        } else {
            &self.auth_plugin_name
        }
    }
}

/// MySQL Handshake Response 41 packet (client -> server)
/// Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_packets_protocol_handshake_response.html>
#[derive(Debug, Clone)]
pub struct HandshakeResponse41 {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    /// Requested collation id
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    /// Database name (if CLIENT_CONNECT_WITH_DB)
    pub database: Option<String>,
    /// Auth plugin name (if CLIENT_PLUGIN_AUTH)
    pub auth_plugin_name: Option<String>,
    /// Connection attributes (if CLIENT_CONNECT_ATTRS)
    pub connect_attrs: Vec<(String, String)>,
}

impl Default for HandshakeResponse41 {
    fn default() -> Self {
        Self {
            capability_flags: 0,
            max_packet_size: PacketHeader::MAX_PAYLOAD_LENGTH,
            character_set: DEFAULT_COLLATION_ID,
            username: String::new(),
            auth_response: Vec::new(),
            database: None,
            auth_plugin_name: None,
            connect_attrs: Vec::new(),
        }
    }
}

impl HandshakeResponse41 {
    /// Client program name from connect attributes.
    ///
    /// Native clients send `program_name`; JDBC drivers only `_client_name`.
    pub fn program_name(&self) -> Option<&str> {
        self.connect_attr("program_name")
            .or_else(|| self.connect_attr("_client_name"))
    }

    /// Any connect attribute by key.
    pub fn connect_attr(&self, key: &str) -> Option<&str> {
        self.connect_attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// MySQL OK Packet
/// Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_ok_packet.html>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl Default for OkPacket {
    fn default() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
            info: String::new(),
        }
    }
}

/// MySQL ERR Packet
/// Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_err_packet.html>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    /// SQL state (5 characters)
    pub sql_state: [u8; 5],
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &[u8; 5], error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state: *sql_state,
            error_message: error_message.into(),
        }
    }

    /// ER_ACCESS_DENIED_ERROR (1045)
    pub fn access_denied(user: &str, host: &str, using_password: bool) -> Self {
        Self::new(
            ER_ACCESS_DENIED_ERROR,
            b"28000",
            format!(
                "Access denied for user '{}'@'{}' (using password: {})",
                user,
                host,
                if using_password { "YES" } else { "NO" }
            ),
        )
    }

    /// ER_HANDSHAKE_ERROR (1043)
    pub fn bad_handshake() -> Self {
        Self::new(ER_HANDSHAKE_ERROR, b"08S01", "Bad handshake")
    }

    /// ER_UNKNOWN_ERROR (1105), used to surface setup failures.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ER_UNKNOWN_ERROR, b"HY000", message)
    }

    /// ER_NOT_SUPPORTED_AUTH_MODE (1251)
    pub fn not_supported_auth_mode() -> Self {
        Self::new(
            ER_NOT_SUPPORTED_AUTH_MODE,
            b"08004",
            "Client does not support authentication protocol requested by server",
        )
    }

    /// SQL state as a string slice.
    pub fn sql_state_str(&self) -> &str {
        std::str::from_utf8(&self.sql_state).unwrap_or("HY000")
    }
}

impl std::fmt::Display for ErrPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ERROR {} ({}): {}",
            self.error_code,
            self.sql_state_str(),
            self.error_message
        )
    }
}

// ============================================================================
// Header bytes and error codes
// ============================================================================

pub const OK_HEADER: u8 = 0x00;
/// Auth switch request (also the EOF header outside the connection phase)
pub const AUTH_SWITCH_REQUEST: u8 = 0xFE;
pub const ERR_HEADER: u8 = 0xFF;
/// More auth data, sent by caching_sha2_password
pub const AUTH_MORE_DATA: u8 = 0x01;
/// caching_sha2_password: scramble matched the server cache
pub const CACHING_SHA2_FAST_AUTH_SUCCESS: u8 = 0x03;
/// caching_sha2_password: server needs the password itself
pub const CACHING_SHA2_FULL_AUTH_REQUIRED: u8 = 0x04;
/// caching_sha2_password: client asks for the server's RSA public key
pub const CACHING_SHA2_REQUEST_PUBLIC_KEY: u8 = 0x02;

pub const ER_HANDSHAKE_ERROR: u16 = 1043;
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
pub const ER_UNKNOWN_ERROR: u16 = 1105;
pub const ER_NOT_SUPPORTED_AUTH_MODE: u16 = 1251;

pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Scramble length used by the password plugins
pub const SCRAMBLE_LENGTH: usize = 20;
/// utf8_general_ci
pub const DEFAULT_COLLATION_ID: u8 = 0x21;
pub const DEFAULT_SERVER_VERSION: &str = "5.7.0-vaultdb-relay";

// ============================================================================
// Capability Flags
// Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/group__group__cs__capabilities__flags.html
// ============================================================================

pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_NO_SCHEMA: u32 = 0x0000_0010;
pub const CLIENT_COMPRESS: u32 = 0x0000_0020;
pub const CLIENT_ODBC: u32 = 0x0000_0040;
pub const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
pub const CLIENT_IGNORE_SPACE: u32 = 0x0000_0100;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_INTERACTIVE: u32 = 0x0000_0400;
pub const CLIENT_SSL: u32 = 0x0000_0800;
pub const CLIENT_IGNORE_SIGPIPE: u32 = 0x0000_1000;
pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
pub const CLIENT_RESERVED: u32 = 0x0000_4000;
/// Old name: CLIENT_SECURE_CONNECTION
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x0004_0000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 0x0040_0000;
pub const CLIENT_SESSION_TRACK: u32 = 0x0080_0000;
pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

/// Capabilities copied from the client's handshake onto the backend connection.
pub const MIRRORED_CAPABILITIES: [u32; 3] = [
    CLIENT_MULTI_RESULTS,
    CLIENT_MULTI_STATEMENTS,
    CLIENT_PS_MULTI_RESULTS,
];

/// Capabilities the relay advertises to clients
pub const DEFAULT_SERVER_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_FOUND_ROWS
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_CONNECT_ATTRS
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;

/// Capabilities always requested from a backend
pub const BASE_CLIENT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_LONG_FLAG
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_PLUGIN_AUTH;

// ============================================================================
// Status Flags
// ============================================================================

pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
