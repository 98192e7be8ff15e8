use std::io;

use quinn::{ReadExactError, WriteError};
use quinn_proto::{ConnectError, ConnectionError};

use crate::neuron::nucleus::NucleusError;

#[derive(Debug)]
pub enum Error {
    ConnectError(ConnectError),
    ConnectionError(ConnectionError),
    Io(io::Error),
    WriteError(WriteError),
    ReadExactError(ReadExactError),
    Tls(rustls::Error),
    BadIdentity(String),
    CouldNotEncodeMessage,
    CouldNotDecodeMessage,
    MessageLengthOverflowed,
    MalformedTensor,
    UnexpectedResponse,
    Remote(String),
    Nucleus(NucleusError),
}

impl From<ConnectError> for Error {
    fn from(error: ConnectError) -> Self {
        Self::ConnectError(error)
    }
}

impl From<ConnectionError> for Error {
    fn from(error: ConnectionError) -> Self {
        Self::ConnectionError(error)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WriteError> for Error {
    fn from(e: quinn::WriteError) -> Self {
        Self::WriteError(e)
    }
}

impl From<ReadExactError> for Error {
    fn from(e: quinn::ReadExactError) -> Self {
        Self::ReadExactError(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

impl From<NucleusError> for Error {
    fn from(e: NucleusError) -> Self {
        Self::Nucleus(e)
    }
}
