//! Function code dispatch.
//!
//! A [`Dispatcher`] maps function codes to [`Handler`]s. Supporting another request type means
//! registering another handler; the connection loop never changes.

use std::{collections::HashMap, fmt, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{
    frame::MAX_PAYLOAD_LENGTH,
    source::{BitTable, DataSource, WordTable},
    FunctionCode, UnitId,
};

pub const READ_COILS: FunctionCode = 0x01;
pub const READ_DISCRETE_INPUTS: FunctionCode = 0x02;
pub const READ_HOLDING_REGISTERS: FunctionCode = 0x03;
pub const READ_INPUT_REGISTERS: FunctionCode = 0x04;

const MAX_READ_BITS: u16 = 2000;
const MAX_READ_WORDS: u16 = 125;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("malformed request for function code 0x{function_code:02X}: {reason}")]
    MalformedRequest {
        function_code: FunctionCode,
        reason: &'static str,
    },

    #[error("quantity {quantity} out of range 1..={max}")]
    QuantityOutOfRange { quantity: u16, max: u16 },

    #[error("response of {0} bytes does not fit in a frame")]
    ResponseTooLarge(usize),

    #[error("{0}")]
    Other(String),
}

/// A decoded request PDU, as seen by a handler.
#[derive(Clone, Copy, Debug)]
pub struct Request<'a> {
    pub unit_id: UnitId,
    pub function_code: FunctionCode,
    pub payload: &'a [u8],
}

/// Produces the response payload for one function code, or `None` to send nothing back.
pub trait Handler: Send + Sync {
    fn handle(&self, request: &Request<'_>) -> Result<Option<Bytes>, DispatchError>;
}

impl<F> Handler for F
where
    F: Fn(&Request<'_>) -> Result<Option<Bytes>, DispatchError> + Send + Sync,
{
    fn handle(&self, request: &Request<'_>) -> Result<Option<Bytes>, DispatchError> {
        self(request)
    }
}

#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<FunctionCode, Arc<dyn Handler>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<_> = self.handlers.keys().collect();
        codes.sort();
        f.debug_struct("Dispatcher")
            .field("function_codes", &codes)
            .finish()
    }
}

impl Dispatcher {
    /// A dispatcher with no handlers at all. Every request is dropped.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The stock read handlers, all fed from `source`.
    pub fn with_source(source: Arc<dyn DataSource>) -> Self {
        let mut dispatcher = Self::empty();
        dispatcher
            .register(READ_COILS, ReadBits::new(BitTable::Coils, source.clone()))
            .register(
                READ_DISCRETE_INPUTS,
                ReadBits::new(BitTable::DiscreteInputs, source.clone()),
            )
            .register(
                READ_HOLDING_REGISTERS,
                ReadWords::new(WordTable::HoldingRegisters, source.clone()),
            )
            .register(
                READ_INPUT_REGISTERS,
                ReadWords::new(WordTable::InputRegisters, source),
            );
        dispatcher
    }

    /// Adds a handler, replacing any previous one for the same code.
    pub fn register<H>(&mut self, function_code: FunctionCode, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        self.handlers.insert(function_code, Arc::new(handler));
        self
    }

    pub fn handles(&self, function_code: FunctionCode) -> bool {
        self.handlers.contains_key(&function_code)
    }

    /// Runs the handler for `request.function_code`.
    ///
    /// Unregistered function codes yield `Ok(None)`: the request is dropped without a Modbus
    /// exception response.
    pub fn dispatch(&self, request: &Request<'_>) -> Result<Option<Bytes>, DispatchError> {
        let Some(handler) = self.handlers.get(&request.function_code) else {
            return Ok(None);
        };

        match handler.handle(request)? {
            Some(payload) if payload.len() > MAX_PAYLOAD_LENGTH => {
                Err(DispatchError::ResponseTooLarge(payload.len()))
            }
            response => Ok(response),
        }
    }
}

/// Splits a read request payload into starting address and quantity.
fn parse_read(request: &Request<'_>, max: u16) -> Result<(u16, u16), DispatchError> {
    let &[a0, a1, q0, q1, ..] = request.payload else {
        return Err(DispatchError::MalformedRequest {
            function_code: request.function_code,
            reason: "expected address and quantity",
        });
    };

    let address = u16::from_be_bytes([a0, a1]);
    let quantity = u16::from_be_bytes([q0, q1]);
    if quantity == 0 || quantity > max {
        return Err(DispatchError::QuantityOutOfRange { quantity, max });
    }
    Ok((address, quantity))
}

/// Reads coils or discrete inputs.
pub struct ReadBits {
    table: BitTable,
    source: Arc<dyn DataSource>,
}

impl ReadBits {
    pub fn new(table: BitTable, source: Arc<dyn DataSource>) -> Self {
        Self { table, source }
    }
}

impl Handler for ReadBits {
    fn handle(&self, request: &Request<'_>) -> Result<Option<Bytes>, DispatchError> {
        let (address, quantity) = parse_read(request, MAX_READ_BITS)?;
        let values = self
            .source
            .read_bits(request.unit_id, self.table, address, quantity);
        if values.len() != quantity as usize {
            return Err(DispatchError::Other(format!(
                "data source returned {} values, expected {quantity}",
                values.len()
            )));
        }

        let packed = pack_bits(&values);
        let mut payload = BytesMut::with_capacity(1 + packed.len());
        payload.put_u8(packed.len() as u8);
        payload.put_slice(&packed);
        Ok(Some(payload.freeze()))
    }
}

/// Reads holding or input registers.
pub struct ReadWords {
    table: WordTable,
    source: Arc<dyn DataSource>,
}

impl ReadWords {
    pub fn new(table: WordTable, source: Arc<dyn DataSource>) -> Self {
        Self { table, source }
    }
}

impl Handler for ReadWords {
    fn handle(&self, request: &Request<'_>) -> Result<Option<Bytes>, DispatchError> {
        let (address, quantity) = parse_read(request, MAX_READ_WORDS)?;
        let words = self
            .source
            .read_words(request.unit_id, self.table, address, quantity);
        if words.len() != quantity as usize {
            return Err(DispatchError::Other(format!(
                "data source returned {} values, expected {quantity}",
                words.len()
            )));
        }

        let mut payload = BytesMut::with_capacity(1 + 2 * words.len());
        payload.put_u8((2 * words.len()) as u8);
        for word in words {
            payload.put_u16(word);
        }
        Ok(Some(payload.freeze()))
    }
}

/// Packs bits LSB first: bit `i` lands in bit `i % 8` of byte `i / 8`.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; (bits.len() + 7) / 8];
    for (i, _) in bits.iter().enumerate().filter(|(_, bit)| **bit) {
        packed[i / 8] |= 1 << (i % 8);
    }
    packed
}

pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| match bytes.get(i / 8) {
            Some(byte) => byte & (1 << (i % 8)) != 0,
            None => false,
        })
        .collect()
}
