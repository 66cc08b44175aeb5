//! Worker exit codes
//!
//! The closed set of codes a protocol worker may exit with, and the
//! classification the reaper applies to them.

/// Exit code of a protocol worker.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerExit {
    TransferSuccess = 0,
    ConnectError = 1,
    UserError = 2,
    PasswordError = 3,
    TypeError = 4,
    ListError = 5,
    MailError = 6,
    JidNumberError = 7,
    GotKilled = 8,
    AuthError = 9,
    OpenRemoteError = 10,
    WriteRemoteError = 11,
    CloseRemoteError = 12,
    MoveRemoteError = 13,
    ChdirError = 14,
    WriteLockError = 15,
    RemoveLockfileError = 16,
    StatError = 17,
    MoveError = 18,
    RenameError = 19,
    TimeoutError = 20,
    ReadRemoteError = 22,
    SizeError = 23,
    DateError = 24,
    QuitError = 25,
    MkdirError = 26,
    ConnectionResetError = 28,
    ConnectionRefusedError = 29,
    OpenLocalError = 30,
    ReadLocalError = 31,
    LockRegionError = 32,
    UnlockRegionError = 33,
    AllocError = 34,
    SelectError = 35,
    WriteLocalError = 36,
    OpenFileDirError = 40,
    NoMessageFile = 41,
    RemoteUserError = 50,
    DataError = 51,
    StatRemoteError = 54,
    StatTargetError = 55,
    DeleteRemoteError = 56,
    ExecError = 57,
    FileSizeMatchError = 58,
    NoopError = 59,
    StillFilesToSend = 60,
    SyntaxError = 61,
    NoFilesToSend = 62,
    PipeClosedError = 63,
}

/// How the reaper treats an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    StillFiles,
    /// Retriable remote failure; the queue entry is aged.
    Ageing,
    /// Failure on the local side; counted as an error, no ageing.
    Local,
    /// Retrying is pointless until the job definition changes.
    Permanent,
    Killed,
    NoFilesToSend,
}

impl WorkerExit {
    pub fn from_code(code: i32) -> Option<Self> {
        use WorkerExit::*;
        Some(match code {
            0 => TransferSuccess,
            1 => ConnectError,
            2 => UserError,
            3 => PasswordError,
            4 => TypeError,
            5 => ListError,
            6 => MailError,
            7 => JidNumberError,
            8 => GotKilled,
            9 => AuthError,
            10 => OpenRemoteError,
            11 => WriteRemoteError,
            12 => CloseRemoteError,
            13 => MoveRemoteError,
            14 => ChdirError,
            15 => WriteLockError,
            16 => RemoveLockfileError,
            17 => StatError,
            18 => MoveError,
            19 => RenameError,
            20 => TimeoutError,
            22 => ReadRemoteError,
            23 => SizeError,
            24 => DateError,
            25 => QuitError,
            26 => MkdirError,
            28 => ConnectionResetError,
            29 => ConnectionRefusedError,
            30 => OpenLocalError,
            31 => ReadLocalError,
            32 => LockRegionError,
            33 => UnlockRegionError,
            34 => AllocError,
            35 => SelectError,
            36 => WriteLocalError,
            40 => OpenFileDirError,
            41 => NoMessageFile,
            50 => RemoteUserError,
            51 => DataError,
            54 => StatRemoteError,
            55 => StatTargetError,
            56 => DeleteRemoteError,
            57 => ExecError,
            58 => FileSizeMatchError,
            59 => NoopError,
            60 => StillFilesToSend,
            61 => SyntaxError,
            62 => NoFilesToSend,
            63 => PipeClosedError,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn kind(self) -> ExitKind {
        use WorkerExit::*;
        match self {
            TransferSuccess => ExitKind::Success,
            StillFilesToSend => ExitKind::StillFiles,
            NoFilesToSend => ExitKind::NoFilesToSend,
            GotKilled => ExitKind::Killed,
            SyntaxError | JidNumberError | NoMessageFile | OpenFileDirError => ExitKind::Permanent,
            MoveError | RenameError | StatError | OpenLocalError | ReadLocalError
            | WriteLocalError | LockRegionError | UnlockRegionError | AllocError
            | SelectError => ExitKind::Local,
            ConnectError
            | UserError
            | PasswordError
            | AuthError
            | RemoteUserError
            | TimeoutError
            | ConnectionResetError
            | ConnectionRefusedError
            | PipeClosedError
            | OpenRemoteError
            | StatRemoteError
            | StatTargetError
            | MoveRemoteError
            | ListError
            | DeleteRemoteError
            | WriteRemoteError
            | ReadRemoteError
            | CloseRemoteError
            | ChdirError
            | MkdirError
            | NoopError
            | TypeError
            | DataError
            | MailError
            | QuitError
            | SizeError
            | DateError
            | ExecError
            | WriteLockError
            | RemoveLockfileError
            | FileSizeMatchError => ExitKind::Ageing,
        }
    }

    /// Whether the exit counts as a fault against the host.
    pub fn is_faulty(self) -> bool {
        matches!(
            self.kind(),
            ExitKind::Ageing | ExitKind::Local | ExitKind::Permanent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_known_code_roundtrips() {
        let mut known = 0;
        for code in 0..=255 {
            if let Some(exit) = WorkerExit::from_code(code) {
                assert_eq!(exit.code() as i32, code);
                known += 1;
            }
        }
        assert_eq!(known, 49);
    }

    #[test]
    fn test_classification() {
        assert_eq!(WorkerExit::ConnectError.kind(), ExitKind::Ageing);
        assert_eq!(WorkerExit::TimeoutError.kind(), ExitKind::Ageing);
        assert_eq!(WorkerExit::JidNumberError.kind(), ExitKind::Permanent);
        assert_eq!(WorkerExit::GotKilled.kind(), ExitKind::Killed);
        assert_eq!(WorkerExit::NoFilesToSend.kind(), ExitKind::NoFilesToSend);
        assert_eq!(WorkerExit::MoveError.kind(), ExitKind::Local);
        assert!(!WorkerExit::GotKilled.is_faulty());
        assert!(WorkerExit::SyntaxError.is_faulty());
        assert!(WorkerExit::from_code(21).is_none());
    }
}
