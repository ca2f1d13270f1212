//! Work-item identity and the payload capability contract.
//!
//! Every item travelling through the broker is wrapped in a [`WorkItem`]
//! carrying a [`Fingerprint`], a [`Command`] tag and an evaluated flag. The
//! fingerprint is the only thing the broker ever looks at; payloads stay
//! opaque to the whole substrate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable identity of a work item for the duration of its flight.
///
/// Assigned exactly once, when the item is submitted; resubmitted items get a
/// fresh `submission` but keep their `generation` and `position`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Fingerprint {
    /// Globally unique id of the producing algorithm driver instance.
    pub producer: u64,
    /// Monotonically increasing within one producer.
    pub submission: u64,
    /// The producer's iteration counter at submission time.
    pub generation: u32,
    /// The item's slot within its generation.
    pub position: u32,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@g{}p{}",
            self.producer, self.submission, self.generation, self.position
        )
    }
}

/// Tells a consumer what to run on the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Evaluate the payload as-is.
    Evaluate,
    /// Mutate the payload, then evaluate it.
    MutateAndEvaluate,
    /// Do nothing; the item passes through evaluated.
    Noop,
}

impl Command {
    /// One-byte wire form.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Evaluate => 0,
            Self::MutateAndEvaluate => 1,
            Self::Noop => 2,
        }
    }

    /// Decodes the one-byte wire form.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Evaluate),
            1 => Some(Self::MutateAndEvaluate),
            2 => Some(Self::Noop),
            _ => None,
        }
    }
}

/// Failure reported by a payload's `process` implementation.
///
/// Worker loops catch this, log it and return the item unevaluated; it never
/// propagates further.
#[derive(Debug, Clone, Error)]
#[error("processing failed: {0}")]
pub struct ProcessingError(pub String);

impl From<String> for ProcessingError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for ProcessingError {
    fn from(msg: &str) -> Self {
        Self(msg.to_owned())
    }
}

/// Capability set required of every payload type.
///
/// Anything that can be processed in place can ride through the broker; deep
/// copies come from `Clone`, and the networked backend additionally requires
/// `Serialize`/`DeserializeOwned` bounds at its own boundary.
pub trait Processable: Send + 'static {
    /// Transforms the payload in place according to `command`.
    ///
    /// An `Err` leaves the surrounding item unevaluated; the item is still
    /// returned to its producer.
    fn process(&mut self, command: Command) -> Result<(), ProcessingError>;
}

/// Envelope around a payload while it travels through the substrate.
#[derive(Debug)]
pub struct WorkItem<T> {
    payload: T,
    fingerprint: Option<Fingerprint>,
    command: Command,
    evaluated: bool,
    synthetic: bool,
}

impl<T> WorkItem<T> {
    /// Wraps a payload. The fingerprint is stamped separately at submission.
    pub fn new(payload: T, command: Command) -> Self {
        Self {
            payload,
            fingerprint: None,
            command,
            evaluated: false,
            synthetic: false,
        }
    }

    /// Stamps the fingerprint. Only the first call has an effect; the
    /// fingerprint is immutable once set.
    pub fn stamp(&mut self, fingerprint: Fingerprint) {
        if self.fingerprint.is_none() {
            self.fingerprint = Some(fingerprint);
        }
    }

    /// The fingerprint, if the item has been submitted.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    /// The command tag attached at creation.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Shared access to the payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Mutable access to the payload. Used by the networked backend to splice
    /// a deserialized result back into the envelope.
    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }

    /// Unwraps the payload, consuming the envelope.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// True iff the last `process` completed without error.
    pub fn is_evaluated(&self) -> bool {
        self.evaluated
    }

    /// Overrides the evaluated flag. The networked backend uses this when the
    /// flag arrives out-of-band on the wire.
    pub fn set_evaluated(&mut self, evaluated: bool) {
        self.evaluated = evaluated;
    }

    /// True iff this slot was filled by the collector's repair pass instead
    /// of a real return.
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// Marks the item as a repair fill-in.
    pub fn mark_synthetic(&mut self) {
        self.synthetic = true;
    }
}

impl<T: Clone> Clone for WorkItem<T> {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            fingerprint: self.fingerprint,
            command: self.command,
            evaluated: self.evaluated,
            synthetic: self.synthetic,
        }
    }
}

impl<T: Processable> WorkItem<T> {
    /// Runs the payload according to the command tag and updates the
    /// evaluated flag. `Noop` short-circuits.
    pub fn process(&mut self) -> Result<(), ProcessingError> {
        self.evaluated = false;
        if self.command == Command::Noop {
            self.evaluated = true;
            return Ok(());
        }
        match self.payload.process(self.command) {
            Ok(()) => {
                self.evaluated = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
