//! Shared protocol constants for every shuttle socket
//!
//! All channels use the same 8-byte header: command (u32 LE) followed by the
//! payload length (u32 LE). Command numbers are grouped per channel.

pub const HEADER_LEN: usize = 8;

// Maximum frame payload size (16MB) - prevents memory exhaustion from a bad peer
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Size of data chunks produced by workers and by put sources
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Daemon <-> spawner channel (fd 3 of the launcher daemon)
pub mod launcher {
    pub const EXEC: u32 = 1;
    pub const SETENV: u32 = 2;
    pub const CHILD_DIED: u32 = 3;
    pub const OK: u32 = 4;
    pub const ERROR: u32 = 5;
    pub const EXEC_NEW: u32 = 6;
    pub const EXT_EXEC: u32 = 8;
    pub const SHELL: u32 = 9;
    pub const TERMINATE_KDE: u32 = 10;
    pub const TERMINATE_LAUNCHER: u32 = 11;
    pub const DEBUG_WAIT: u32 = 12;
    pub const KWRAPPER: u32 = 13;

    pub fn name(cmd: u32) -> &'static str {
        match cmd {
            EXEC => "EXEC",
            SETENV => "SETENV",
            CHILD_DIED => "CHILD_DIED",
            OK => "OK",
            ERROR => "ERROR",
            EXEC_NEW => "EXEC_NEW",
            EXT_EXEC => "EXT_EXEC",
            SHELL => "SHELL",
            TERMINATE_KDE => "TERMINATE_KDE",
            TERMINATE_LAUNCHER => "TERMINATE_LAUNCHER",
            DEBUG_WAIT => "DEBUG_WAIT",
            KWRAPPER => "KWRAPPER",
            _ => "UNKNOWN",
        }
    }
}

/// Job -> worker commands
pub mod command {
    pub const HOST: u32 = 48;
    pub const CONNECT: u32 = 49;
    pub const DISCONNECT: u32 = 50;
    pub const SLAVE_STATUS: u32 = 51;
    pub const SLAVE_CONNECT: u32 = 52;
    pub const SLAVE_HOLD: u32 = 53;
    pub const NONE: u32 = 65;
    pub const GET: u32 = 67;
    pub const PUT: u32 = 68;
    pub const STAT: u32 = 69;
    pub const MIMETYPE: u32 = 70;
    pub const LISTDIR: u32 = 71;
    pub const MKDIR: u32 = 72;
    pub const RENAME: u32 = 73;
    pub const COPY: u32 = 74;
    pub const DEL: u32 = 75;
    pub const CHMOD: u32 = 76;
    pub const SPECIAL: u32 = 77;
    pub const META_DATA: u32 = 80;
    pub const RESUME_ANSWER: u32 = 84;
}

/// Worker -> job messages (informational and data plane)
pub mod message {
    pub const TOTAL_SIZE: u32 = 10;
    pub const PROCESSED_SIZE: u32 = 11;
    pub const SPEED: u32 = 12;
    pub const REDIRECTION: u32 = 20;
    pub const MIME_TYPE: u32 = 21;
    pub const WARNING: u32 = 23;
    pub const META_DATA: u32 = 26;

    pub const DATA: u32 = 100;
    pub const DATA_REQUEST: u32 = 101;
    pub const ERROR: u32 = 102;
    pub const CONNECTED: u32 = 103;
    pub const FINISHED: u32 = 104;
    pub const STAT_ENTRY: u32 = 105;
    pub const LIST_ENTRIES: u32 = 106;
    pub const RENAMED: u32 = 107;
    pub const RESUME: u32 = 108;
    pub const SLAVE_STATUS: u32 = 109;
    pub const SLAVE_ACK: u32 = 110;
    pub const CAN_RESUME: u32 = 114;
}

/// Client <-> launcher daemon control socket
pub mod control {
    pub const EXEC_SERVICE: u32 = 200;
    pub const START_PROGRAM: u32 = 201;
    pub const SET_LAUNCH_ENV: u32 = 202;
    pub const REGISTER_NAME: u32 = 203;
    pub const REQUEST_WORKER: u32 = 204;
    pub const REQUEST_HOLD_WORKER: u32 = 205;
    pub const WAIT_FOR_WORKER: u32 = 206;
    pub const AUTOSTART: u32 = 207;
    pub const TERMINATE: u32 = 208;

    pub const REPLY_LAUNCH: u32 = 220;
    pub const REPLY_WORKER: u32 = 221;
    pub const REPLY_ACK: u32 = 222;
    pub const REPLY_ERROR: u32 = 223;
    pub const REPLY_AUTOSTART_DONE: u32 = 224;
}

/// Status bytes written by a freshly forked child on the spawner's status pipe
pub mod spawn_status {
    pub const OK: u8 = 0;
    pub const FAILED: u8 = 1;
    pub const EXEC_FALLBACK: u8 = 2;
    pub const FAILED_WITH_MESSAGE: u8 = 3;
}

// Centralized timeout constants
pub mod timeouts {
    // Time a freshly accepted pool connection has to announce its status (ms)
    pub const STATUS_ANSWER_MS: u64 = 10_000;

    // Time a job waits for a requested worker to connect back (ms)
    pub const WORKER_CONNECT_MS: u64 = 30_000;

    // Client connect to the launcher control socket (ms)
    pub const CONNECT_MS: u64 = 2_000;

    // Progress tick interval for UI updates (ms)
    pub const PROGRESS_TICK_MS: u64 = 250;

    // Minimum spacing between speed recalculations (ms)
    pub const SPEED_RECALC_MS: u64 = 900;

    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 5_000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 10;

    // 5s base + 10ms per 1MB payload (ceil)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        WRITE_BASE_MS + mb * PER_MB_MS
    }
}
