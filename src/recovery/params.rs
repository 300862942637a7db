//! Wire parameters exchanged during phantom range recovery.
//!
//! All parameters start with a one byte encoding version, followed by
//! fields in little-endian, strings and byte blobs are length prefixed
//! with a varint.

use std::fmt;

use crate::{
    table::{RangeSpec, TableIdentifier},
    util, Error, Result,
};

/// Encoding version for recovery parameters.
pub const PARAMS_VERSION: u8 = 1;

fn decode_version(buf: &mut &[u8], what: &str) -> Result<()> {
    match util::decode_u8(buf)? {
        PARAMS_VERSION => Ok(()),
        ver => err_at!(DecodeFail, msg: "{} unsupported version {}", what, ver),
    }
}

/// Batch of phantom updates, for a fragment of the failed server's commit
/// log, addressed to a range being recovered.
#[derive(Clone, Debug, PartialEq)]
pub struct PhantomUpdate {
    pub op_id: i64,
    pub location: String,
    pub plan_generation: i32,
    pub table: TableIdentifier,
    pub spec: RangeSpec,
    pub fragment: u32,
    /// More payloads follow for this fragment.
    pub more: bool,
    /// Serialized mutations, with revisions.
    pub payload: Vec<u8>,
}

impl PhantomUpdate {
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<usize> {
        let m = buf.len();
        util::encode_u8(buf, PARAMS_VERSION);
        util::encode_i64(buf, self.op_id);
        util::encode_vstr(buf, &self.location)?;
        util::encode_i32(buf, self.plan_generation);
        self.table.encode(buf)?;
        self.spec.encode(buf)?;
        util::encode_u32(buf, self.fragment);
        util::encode_u8(buf, if self.more { 1 } else { 0 });
        util::encode_bytes(buf, &self.payload)?;
        Ok(buf.len() - m)
    }

    pub fn decode(buf: &mut &[u8]) -> Result<PhantomUpdate> {
        decode_version(buf, "phantom-update")?;
        let val = PhantomUpdate {
            op_id: util::decode_i64(buf)?,
            location: util::decode_vstr(buf)?,
            plan_generation: util::decode_i32(buf)?,
            table: TableIdentifier::decode(buf)?,
            spec: RangeSpec::decode(buf)?,
            fragment: util::decode_u32(buf)?,
            more: util::decode_u8(buf)? != 0,
            payload: util::decode_bytes(buf)?.to_vec(),
        };
        Ok(val)
    }
}

/// Completion notice sent to the master after preparing or committing
/// phantom ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompleteParams {
    pub op_id: i64,
    pub location: String,
    pub plan_generation: i32,
    pub error: i32,
    pub message: String,
}

pub type PhantomPrepareComplete = CompleteParams;
pub type PhantomCommitComplete = CompleteParams;

impl fmt::Display for CompleteParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "op:{} location:{} plan:{} error:{}",
            self.op_id,
            self.location,
            self.plan_generation,
            crate::error::code::to_text(self.error)
        )
    }
}

impl CompleteParams {
    /// Compose completion notice, successful if `res` is Ok.
    pub fn new(op_id: i64, location: &str, plan_generation: i32, res: &Result<()>) -> Self {
        let (error, message) = match res {
            Ok(()) => (crate::error::code::OK, String::new()),
            Err(err) => (err.to_code(), err.to_message()),
        };
        CompleteParams {
            op_id,
            location: location.to_string(),
            plan_generation,
            error,
            message,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error == crate::error::code::OK
    }

    /// Turn a failure notice back into an error.
    pub fn to_result(&self) -> Result<()> {
        match self.is_ok() {
            true => Ok(()),
            false => Err(Error::Fatal(self.to_string(), self.message.clone())),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<usize> {
        let m = buf.len();
        util::encode_u8(buf, PARAMS_VERSION);
        util::encode_i64(buf, self.op_id);
        util::encode_vstr(buf, &self.location)?;
        util::encode_i32(buf, self.plan_generation);
        util::encode_i32(buf, self.error);
        util::encode_vstr(buf, &self.message)?;
        Ok(buf.len() - m)
    }

    pub fn decode(buf: &mut &[u8]) -> Result<CompleteParams> {
        decode_version(buf, "complete-params")?;
        let val = CompleteParams {
            op_id: util::decode_i64(buf)?,
            location: util::decode_vstr(buf)?,
            plan_generation: util::decode_i32(buf)?,
            error: util::decode_i32(buf)?,
            message: util::decode_vstr(buf)?,
        };
        Ok(val)
    }
}

#[cfg(test)]
#[path = "params_test.rs"]
mod params_test;
