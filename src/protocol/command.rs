//! Opcode sets and the fully-parsed inbound `Command`.
//!
//! Each opcode implies a fixed sequence of follow-on reads. `Command::read_from`
//! consumes exactly that sequence or fails, so a command is never half-read.

use super::transport::{FrameReader, FrameWriter};
use crate::error::ProtocolError;
use std::io::{Read, Write};

/// Inbound opcodes, coordinator -> client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Connected = 0,
    Watching = 1,
    Log = 2,
    Signed = 3,
    Load = 4,
    Inject = 5,
    IdeProcPath = 6,
    Xprobe = 7,
    Eval = 8,
    SettingsChanged = 9,
    Trace = 10,
    Untrace = 11,
    TraceUi = 12,
    TraceUiToolkit = 13,
    TraceSwiftUi = 14,
    TraceFramework = 15,
    QuietInclude = 16,
    Include = 17,
    Exclude = 18,
    Stats = 19,
    CallOrder = 20,
    FileOrder = 21,
    FileReorder = 22,
    Uninterpose = 23,
    Feedback = 24,
    Lookup = 25,
    Counts = 26,
    Copy = 27,
    MarkupReload = 28,
    Invalid = 1000,
    End = 0xFFFF_FFFF,
}

impl Opcode {
    pub const ALL: [Opcode; 31] = [
        Opcode::Connected,
        Opcode::Watching,
        Opcode::Log,
        Opcode::Signed,
        Opcode::Load,
        Opcode::Inject,
        Opcode::IdeProcPath,
        Opcode::Xprobe,
        Opcode::Eval,
        Opcode::SettingsChanged,
        Opcode::Trace,
        Opcode::Untrace,
        Opcode::TraceUi,
        Opcode::TraceUiToolkit,
        Opcode::TraceSwiftUi,
        Opcode::TraceFramework,
        Opcode::QuietInclude,
        Opcode::Include,
        Opcode::Exclude,
        Opcode::Stats,
        Opcode::CallOrder,
        Opcode::FileOrder,
        Opcode::FileReorder,
        Opcode::Uninterpose,
        Opcode::Feedback,
        Opcode::Lookup,
        Opcode::Counts,
        Opcode::Copy,
        Opcode::MarkupReload,
        Opcode::Invalid,
        Opcode::End,
    ];

    pub fn from_raw(raw: u32) -> Option<Opcode> {
        Self::ALL.iter().copied().find(|op| *op as u32 == raw)
    }
}

/// Outbound opcodes, client -> coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Response {
    Complete = 0,
    Pause = 1,
    Sign = 2,
    Error = 3,
    FrameworkList = 4,
    CallOrderList = 5,
}

/// A complete inbound command with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connected { project: Option<String> },
    Watching { directory: Option<String> },
    Log { text: Option<String> },
    Signed { approved: bool },
    Load {
        changed: Option<String>,
        module: Option<Vec<u8>>,
        /// Symbol list side-car; only on the wire for targets that need discovery.
        sidecar: Option<Vec<u8>>,
    },
    Inject { changed: Option<String> },
    IdeProcPath { path: Option<String> },
    Xprobe { target: Option<String> },
    Eval { request: Option<String> },
    SettingsChanged { json: Option<String> },
    Trace,
    Untrace,
    TraceUi,
    TraceUiToolkit,
    TraceSwiftUi,
    TraceFramework { name: Option<String> },
    QuietInclude { pattern: Option<String> },
    Include { pattern: Option<String> },
    Exclude { pattern: Option<String> },
    Stats,
    CallOrder,
    FileOrder,
    FileReorder,
    Uninterpose,
    Feedback { enabled: bool },
    Lookup { enabled: bool },
    Counts,
    Copy { module: Option<Vec<u8>> },
    MarkupReload { changed: Option<String> },
    Invalid,
    End,
}

fn flag(value: Option<String>) -> bool {
    value.as_deref() == Some("1")
}

fn flag_str(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

impl Command {
    /// Read one opcode and its payload.
    ///
    /// `load_has_sidecar` tells whether `Load` carries the second blob, which
    /// depends on the negotiated target architecture.
    pub fn read_from<R: Read>(
        reader: &mut FrameReader<R>,
        load_has_sidecar: bool,
    ) -> Result<Command, ProtocolError> {
        let raw = reader.read_opcode()?;
        let opcode = Opcode::from_raw(raw).ok_or(ProtocolError::UnknownOpcode(raw))?;
        let command = match opcode {
            Opcode::Connected => Command::Connected {
                project: reader.read_string()?,
            },
            Opcode::Watching => Command::Watching {
                directory: reader.read_string()?,
            },
            Opcode::Log => Command::Log {
                text: reader.read_string()?,
            },
            Opcode::Signed => Command::Signed {
                approved: flag(reader.read_string()?),
            },
            Opcode::Load => {
                let changed = reader.read_string()?;
                let module = reader.read_blob()?;
                let sidecar = if load_has_sidecar {
                    reader.read_blob()?
                } else {
                    None
                };
                Command::Load {
                    changed,
                    module,
                    sidecar,
                }
            }
            Opcode::Inject => Command::Inject {
                changed: reader.read_string()?,
            },
            Opcode::IdeProcPath => Command::IdeProcPath {
                path: reader.read_string()?,
            },
            Opcode::Xprobe => Command::Xprobe {
                target: reader.read_string()?,
            },
            Opcode::Eval => Command::Eval {
                request: reader.read_string()?,
            },
            Opcode::SettingsChanged => Command::SettingsChanged {
                json: reader.read_string()?,
            },
            Opcode::Trace => Command::Trace,
            Opcode::Untrace => Command::Untrace,
            Opcode::TraceUi => Command::TraceUi,
            Opcode::TraceUiToolkit => Command::TraceUiToolkit,
            Opcode::TraceSwiftUi => Command::TraceSwiftUi,
            Opcode::TraceFramework => Command::TraceFramework {
                name: reader.read_string()?,
            },
            Opcode::QuietInclude => Command::QuietInclude {
                pattern: reader.read_string()?,
            },
            Opcode::Include => Command::Include {
                pattern: reader.read_string()?,
            },
            Opcode::Exclude => Command::Exclude {
                pattern: reader.read_string()?,
            },
            Opcode::Stats => Command::Stats,
            Opcode::CallOrder => Command::CallOrder,
            Opcode::FileOrder => Command::FileOrder,
            Opcode::FileReorder => Command::FileReorder,
            Opcode::Uninterpose => Command::Uninterpose,
            Opcode::Feedback => Command::Feedback {
                enabled: flag(reader.read_string()?),
            },
            Opcode::Lookup => Command::Lookup {
                enabled: flag(reader.read_string()?),
            },
            Opcode::Counts => Command::Counts,
            Opcode::Copy => Command::Copy {
                module: reader.read_blob()?,
            },
            Opcode::MarkupReload => Command::MarkupReload {
                changed: reader.read_string()?,
            },
            Opcode::Invalid => Command::Invalid,
            Opcode::End => Command::End,
        };
        Ok(command)
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Connected { .. } => Opcode::Connected,
            Command::Watching { .. } => Opcode::Watching,
            Command::Log { .. } => Opcode::Log,
            Command::Signed { .. } => Opcode::Signed,
            Command::Load { .. } => Opcode::Load,
            Command::Inject { .. } => Opcode::Inject,
            Command::IdeProcPath { .. } => Opcode::IdeProcPath,
            Command::Xprobe { .. } => Opcode::Xprobe,
            Command::Eval { .. } => Opcode::Eval,
            Command::SettingsChanged { .. } => Opcode::SettingsChanged,
            Command::Trace => Opcode::Trace,
            Command::Untrace => Opcode::Untrace,
            Command::TraceUi => Opcode::TraceUi,
            Command::TraceUiToolkit => Opcode::TraceUiToolkit,
            Command::TraceSwiftUi => Opcode::TraceSwiftUi,
            Command::TraceFramework { .. } => Opcode::TraceFramework,
            Command::QuietInclude { .. } => Opcode::QuietInclude,
            Command::Include { .. } => Opcode::Include,
            Command::Exclude { .. } => Opcode::Exclude,
            Command::Stats => Opcode::Stats,
            Command::CallOrder => Opcode::CallOrder,
            Command::FileOrder => Opcode::FileOrder,
            Command::FileReorder => Opcode::FileReorder,
            Command::Uninterpose => Opcode::Uninterpose,
            Command::Feedback { .. } => Opcode::Feedback,
            Command::Lookup { .. } => Opcode::Lookup,
            Command::Counts => Opcode::Counts,
            Command::Copy { .. } => Opcode::Copy,
            Command::MarkupReload { .. } => Opcode::MarkupReload,
            Command::Invalid => Opcode::Invalid,
            Command::End => Opcode::End,
        }
    }

    /// Coordinator-side encoding. Used by test harnesses and tooling that
    /// drive a client without a real coordinator.
    pub fn write_to<W: Write>(
        &self,
        writer: &mut FrameWriter<W>,
        load_has_sidecar: bool,
    ) -> std::io::Result<()> {
        fn opt_str<W: Write>(w: &mut FrameWriter<W>, s: &Option<String>) -> std::io::Result<()> {
            match s {
                Some(s) => w.write_string(s),
                None => w.write_absent(),
            }
        }
        fn opt_blob<W: Write>(w: &mut FrameWriter<W>, b: &Option<Vec<u8>>) -> std::io::Result<()> {
            match b {
                Some(b) => w.write_blob(b),
                None => w.write_absent(),
            }
        }

        writer.write_opcode(self.opcode() as u32)?;
        match self {
            Command::Connected { project: s }
            | Command::Watching { directory: s }
            | Command::Log { text: s }
            | Command::Inject { changed: s }
            | Command::IdeProcPath { path: s }
            | Command::Xprobe { target: s }
            | Command::Eval { request: s }
            | Command::SettingsChanged { json: s }
            | Command::TraceFramework { name: s }
            | Command::QuietInclude { pattern: s }
            | Command::Include { pattern: s }
            | Command::Exclude { pattern: s }
            | Command::MarkupReload { changed: s } => opt_str(writer, s),
            Command::Signed { approved: v }
            | Command::Feedback { enabled: v }
            | Command::Lookup { enabled: v } => writer.write_string(flag_str(*v)),
            Command::Load {
                changed,
                module,
                sidecar,
            } => {
                opt_str(writer, changed)?;
                opt_blob(writer, module)?;
                if load_has_sidecar {
                    opt_blob(writer, sidecar)?;
                }
                Ok(())
            }
            Command::Copy { module } => opt_blob(writer, module),
            Command::Trace
            | Command::Untrace
            | Command::TraceUi
            | Command::TraceUiToolkit
            | Command::TraceSwiftUi
            | Command::Stats
            | Command::CallOrder
            | Command::FileOrder
            | Command::FileReorder
            | Command::Uninterpose
            | Command::Counts
            | Command::Invalid
            | Command::End => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn every_opcode_value_is_unique() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_raw(op as u32), Some(op));
        }
        assert_eq!(Opcode::from_raw(999), None);
    }

    #[test]
    fn unknown_opcode_is_a_protocol_error() {
        let mut reader = FrameReader::new(Cursor::new(999u32.to_le_bytes().to_vec()));
        assert!(matches!(
            Command::read_from(&mut reader, false),
            Err(ProtocolError::UnknownOpcode(999))
        ));
    }

    #[test]
    fn signed_verdict_is_strictly_one() {
        for (text, expected) in [("1", true), ("0", false), ("yes", false)] {
            let mut w = FrameWriter::new(Vec::new());
            w.write_opcode(Opcode::Signed as u32).unwrap();
            w.write_string(text).unwrap();
            let mut reader = FrameReader::new(Cursor::new(w.into_inner()));
            assert_eq!(
                Command::read_from(&mut reader, false).unwrap(),
                Command::Signed { approved: expected }
            );
        }
    }

    fn opt_string() -> impl Strategy<Value = Option<String>> {
        proptest::option::of("[a-zA-Z0-9/._^%-]{0,24}")
    }

    fn opt_bytes() -> impl Strategy<Value = Option<Vec<u8>>> {
        proptest::option::of(proptest::collection::vec(any::<u8>(), 0..64))
    }

    /// Payload strategy for one opcode. The match is exhaustive so a new
    /// opcode cannot be left out of the framing property.
    fn payload(op: Opcode, sidecar: bool) -> BoxedStrategy<Command> {
        match op {
            Opcode::Connected => opt_string().prop_map(|project| Command::Connected { project }).boxed(),
            Opcode::Watching => opt_string().prop_map(|directory| Command::Watching { directory }).boxed(),
            Opcode::Log => opt_string().prop_map(|text| Command::Log { text }).boxed(),
            Opcode::Signed => any::<bool>().prop_map(|approved| Command::Signed { approved }).boxed(),
            Opcode::Load => (opt_string(), opt_bytes(), opt_bytes())
                .prop_map(move |(changed, module, sc)| Command::Load {
                    changed,
                    module,
                    sidecar: if sidecar { sc } else { None },
                })
                .boxed(),
            Opcode::Inject => opt_string().prop_map(|changed| Command::Inject { changed }).boxed(),
            Opcode::IdeProcPath => opt_string().prop_map(|path| Command::IdeProcPath { path }).boxed(),
            Opcode::Xprobe => opt_string().prop_map(|target| Command::Xprobe { target }).boxed(),
            Opcode::Eval => opt_string().prop_map(|request| Command::Eval { request }).boxed(),
            Opcode::SettingsChanged => opt_string().prop_map(|json| Command::SettingsChanged { json }).boxed(),
            Opcode::Trace => Just(Command::Trace).boxed(),
            Opcode::Untrace => Just(Command::Untrace).boxed(),
            Opcode::TraceUi => Just(Command::TraceUi).boxed(),
            Opcode::TraceUiToolkit => Just(Command::TraceUiToolkit).boxed(),
            Opcode::TraceSwiftUi => Just(Command::TraceSwiftUi).boxed(),
            Opcode::TraceFramework => opt_string().prop_map(|name| Command::TraceFramework { name }).boxed(),
            Opcode::QuietInclude => opt_string().prop_map(|pattern| Command::QuietInclude { pattern }).boxed(),
            Opcode::Include => opt_string().prop_map(|pattern| Command::Include { pattern }).boxed(),
            Opcode::Exclude => opt_string().prop_map(|pattern| Command::Exclude { pattern }).boxed(),
            Opcode::Stats => Just(Command::Stats).boxed(),
            Opcode::CallOrder => Just(Command::CallOrder).boxed(),
            Opcode::FileOrder => Just(Command::FileOrder).boxed(),
            Opcode::FileReorder => Just(Command::FileReorder).boxed(),
            Opcode::Uninterpose => Just(Command::Uninterpose).boxed(),
            Opcode::Feedback => any::<bool>().prop_map(|enabled| Command::Feedback { enabled }).boxed(),
            Opcode::Lookup => any::<bool>().prop_map(|enabled| Command::Lookup { enabled }).boxed(),
            Opcode::Counts => Just(Command::Counts).boxed(),
            Opcode::Copy => opt_bytes().prop_map(|module| Command::Copy { module }).boxed(),
            Opcode::MarkupReload => opt_string().prop_map(|changed| Command::MarkupReload { changed }).boxed(),
            Opcode::Invalid => Just(Command::Invalid).boxed(),
            Opcode::End => Just(Command::End).boxed(),
        }
    }

    fn command(sidecar: bool) -> impl Strategy<Value = Command> {
        proptest::sample::select(Opcode::ALL.to_vec()).prop_flat_map(move |op| payload(op, sidecar))
    }

    #[test]
    fn generator_covers_every_opcode() {
        use proptest::strategy::ValueTree;
        use proptest::test_runner::TestRunner;

        let mut runner = TestRunner::default();
        for op in Opcode::ALL {
            let generated = payload(op, true).new_tree(&mut runner).unwrap().current();
            assert_eq!(generated.opcode(), op);
        }
    }

    proptest! {
        // The reader consumes exactly the bytes each command's payload
        // occupies: decoding a sequence leaves a trailing sentinel untouched.
        #[test]
        fn framing_consumes_exact_payloads(
            (sidecar, commands) in any::<bool>().prop_flat_map(|sidecar| {
                proptest::collection::vec(command(sidecar), 0..16)
                    .prop_map(move |commands| (sidecar, commands))
            }),
        ) {
            let mut w = FrameWriter::new(Vec::new());
            for c in &commands {
                c.write_to(&mut w, sidecar).unwrap();
            }
            let mut bytes = w.into_inner();
            let encoded_len = bytes.len();
            bytes.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());

            let mut reader = FrameReader::new(Cursor::new(bytes));
            for expected in &commands {
                let got = Command::read_from(&mut reader, sidecar).unwrap();
                prop_assert_eq!(&got, expected);
            }
            let cursor = reader.into_inner();
            prop_assert_eq!(cursor.position() as usize, encoded_len);
        }
    }
}
