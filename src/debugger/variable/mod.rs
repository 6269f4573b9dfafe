pub mod cmp;

use crate::debugger::debugee::dwarf::r#type::{TypeClass, TypeMeta, ValueEncoding, MAX_DIMENSIONS};
use crate::debugger::error::{ok_or_log, Error};
use crate::debugger::tracer::Tracer;
use log::Level;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::rc::Rc;
use strum_macros::Display;

/// Storage class of a watched variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Static storage, absolute address.
    Global { addr: usize },
    /// Automatic storage, signed offset relative to the live base pointer.
    Local { offset: i64 },
}

impl Scope {
    pub fn label(&self) -> &'static str {
        match self {
            Scope::Global { .. } => "global",
            Scope::Local { .. } => "local",
        }
    }
}

/// Name filter over the watched variable set.
#[derive(Debug, Clone, Default)]
pub enum VarFilter {
    #[default]
    None,
    /// Watch only the named variables.
    Watch(HashSet<String>),
    /// Watch everything but the named variables.
    Ignore(HashSet<String>),
}

impl VarFilter {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            VarFilter::None => true,
            VarFilter::Watch(names) => names.contains(name),
            VarFilter::Ignore(names) => !names.contains(name),
        }
    }
}

/// Storage-class restriction of the watched variable set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeSelection {
    #[default]
    All,
    OnlyLocals,
    OnlyGlobals,
}

/// Static description of one watched variable. Shared by reference between
/// recursion contexts, only the value slots are per-context.
#[derive(Debug)]
pub struct Descriptor {
    pub name: String,
    pub scope: Scope,
    pub type_meta: TypeMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransitionKind {
    Initialized,
    Changed,
}

/// One observed transition of a watched variable or array element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub name: String,
    pub scope_label: &'static str,
    pub kind: TransitionKind,
    /// Element index per dimension, empty for non-arrays.
    pub indices: SmallVec<[u64; MAX_DIMENSIONS]>,
    pub before: String,
    pub after: String,
}

/// Per-context mutable state of a watched variable.
#[derive(Debug)]
enum ValueSlot {
    Scalar {
        /// Last known good value.
        value: u128,
        /// Value observed right after the prologue, reference for
        /// first-initialisation detection.
        scratch: u128,
        initialized: bool,
    },
    Array {
        /// Last read content, empty until the post-prologue read.
        snapshot: Vec<u8>,
    },
}

#[derive(Debug)]
pub struct WatchedVariable {
    pub desc: Rc<Descriptor>,
    slot: ValueSlot,
}

impl WatchedVariable {
    fn new(desc: Rc<Descriptor>) -> Self {
        let slot = match desc.type_meta.class {
            TypeClass::Array => ValueSlot::Array { snapshot: vec![] },
            _ => ValueSlot::Scalar {
                value: 0,
                scratch: 0,
                initialized: false,
            },
        };
        Self { desc, slot }
    }

    /// Runtime address of the variable storage.
    fn address(&self, tracer: &Tracer) -> Result<usize, Error> {
        match self.desc.scope {
            Scope::Global { addr } => Ok(addr),
            Scope::Local { offset } => {
                let bp = tracer.bp()? as i64;
                Ok((bp + offset) as usize)
            }
        }
    }
}

/// One live invocation of the traced function: value slots for every watched
/// variable plus the captured return address.
#[derive(Debug)]
pub struct FunctionContext {
    pub variables: Vec<WatchedVariable>,
    pub return_addr: Option<usize>,
    /// Values must be initialised at the next statement stop.
    pub needs_init: bool,
    /// Line of the statement executed before the current stop.
    pub prev_line: Option<u64>,
}

impl FunctionContext {
    pub fn new(descriptors: &[Rc<Descriptor>]) -> Self {
        Self {
            variables: descriptors
                .iter()
                .map(|desc| WatchedVariable::new(desc.clone()))
                .collect(),
            return_addr: None,
            needs_init: true,
            prev_line: None,
        }
    }

    /// Release array buffers when the invocation returns; the shared descriptors
    /// stay untouched.
    pub fn free_buffers(&mut self) {
        for var in &mut self.variables {
            if let ValueSlot::Array { ref mut snapshot } = var.slot {
                *snapshot = vec![];
            }
        }
    }
}

/// Typed value read of a scalar-like variable.
fn read_scalar(tracer: &Tracer, desc: &Descriptor, addr: usize) -> Result<u128, Error> {
    match desc.type_meta.byte_size {
        1 | 2 | 4 | 8 => {
            let word = tracer.read_word(addr)?;
            let bits = 8 * desc.type_meta.byte_size as u32;
            let mask = u64::MAX >> (64 - bits);
            Ok((word & mask) as u128)
        }
        16 => {
            let lo = tracer.read_word(addr)?;
            let hi = tracer.read_word(addr + 8)?;
            Ok(lo as u128 | (hi as u128) << 64)
        }
        size => Err(Error::UnsupportedVariableSize {
            name: desc.name.clone(),
            size,
        }),
    }
}

/// Perform the first read after the function prologue. Globals are considered
/// initialised immediately; locals are not, their stack slot may still hold
/// arbitrary bytes, so the read lands in the scratch value instead.
pub fn initialize(variables: &mut [WatchedVariable], tracer: &Tracer) {
    for var in variables.iter_mut() {
        let desc = var.desc.clone();
        let Some(addr) = ok_or_log(var.address(tracer), Level::Debug) else {
            continue;
        };

        match var.slot {
            ValueSlot::Scalar {
                ref mut value,
                ref mut scratch,
                ref mut initialized,
            } => {
                let Some(current) = ok_or_log(read_scalar(tracer, &desc, addr), Level::Debug)
                else {
                    continue;
                };
                match desc.scope {
                    Scope::Global { .. } => {
                        *value = current;
                        *initialized = true;
                    }
                    Scope::Local { .. } => {
                        *scratch = current;
                        *initialized = false;
                    }
                }
            }
            ValueSlot::Array { ref mut snapshot } => {
                let bytes = tracer.read_bytes(addr, desc.type_meta.byte_size as usize);
                let Some(buf) = ok_or_log(bytes, Level::Debug) else {
                    continue;
                };
                *snapshot = buf;
            }
        }
    }
}

/// Compare every watched variable against its stored state and collect the
/// transitions. An unreadable variable is skipped for the current hit.
pub fn check_changes(variables: &mut [WatchedVariable], tracer: &Tracer) -> Vec<Change> {
    let mut changes = vec![];

    for var in variables.iter_mut() {
        let desc = var.desc.clone();
        let Some(addr) = ok_or_log(var.address(tracer), Level::Debug) else {
            continue;
        };

        match var.slot {
            ValueSlot::Scalar {
                ref mut value,
                ref mut scratch,
                ref mut initialized,
            } => {
                let Some(current) = ok_or_log(read_scalar(tracer, &desc, addr), Level::Debug)
                else {
                    continue;
                };

                if !*initialized {
                    if current != *scratch {
                        changes.push(Change {
                            name: desc.name.clone(),
                            scope_label: desc.scope.label(),
                            kind: TransitionKind::Initialized,
                            indices: SmallVec::new(),
                            before: canonical_zero(desc.type_meta.encoding).to_string(),
                            after: render_value(
                                desc.type_meta.encoding,
                                desc.type_meta.byte_size,
                                current,
                            ),
                        });
                        *value = current;
                        *initialized = true;
                    }
                } else if current != *value {
                    changes.push(Change {
                        name: desc.name.clone(),
                        scope_label: desc.scope.label(),
                        kind: TransitionKind::Changed,
                        indices: SmallVec::new(),
                        before: render_value(desc.type_meta.encoding, desc.type_meta.byte_size, *value),
                        after: render_value(desc.type_meta.encoding, desc.type_meta.byte_size, current),
                    });
                    *value = current;
                }
            }
            ValueSlot::Array { ref mut snapshot } => {
                let shape = desc.type_meta.array.as_ref().expect("array has a shape");
                let bytes = tracer.read_bytes(addr, desc.type_meta.byte_size as usize);
                let Some(fresh) = ok_or_log(bytes, Level::Debug) else {
                    continue;
                };

                if snapshot.len() == fresh.len() {
                    let element_size = shape.element_size as usize;
                    let mut start = 0;
                    while start < fresh.len() {
                        let Some(found) =
                            cmp::offmemcmp(&snapshot[start..], &fresh[start..], element_size)
                        else {
                            break;
                        };
                        let offset = start + found;
                        let before = element_bits(&snapshot[offset..offset + element_size]);
                        let after = element_bits(&fresh[offset..offset + element_size]);
                        changes.push(Change {
                            name: desc.name.clone(),
                            scope_label: desc.scope.label(),
                            kind: TransitionKind::Changed,
                            indices: cmp::offset_to_indices(
                                offset,
                                shape.element_size,
                                &shape.extents,
                            ),
                            before: render_value(shape.element_encoding, shape.element_size, before),
                            after: render_value(shape.element_encoding, shape.element_size, after),
                        });
                        start = offset + element_size;
                    }
                }
                // the fresh buffer always becomes the new baseline
                *snapshot = fresh;
            }
        }
    }

    changes
}

fn element_bits(bytes: &[u8]) -> u128 {
    let mut buf = [0u8; 16];
    buf[..bytes.len()].copy_from_slice(bytes);
    u128::from_le_bytes(buf)
}

/// The "before" value of a first initialisation.
pub fn canonical_zero(encoding: ValueEncoding) -> &'static str {
    match encoding {
        ValueEncoding::Float => "0.0",
        _ => "0",
    }
}

/// Format a raw value per its DWARF encoding and width: decimal for integers,
/// floating point for float widths, hex for pointers. One-byte printable
/// characters display the character as well.
pub fn render_value(encoding: ValueEncoding, byte_size: u64, bits: u128) -> String {
    match (encoding, byte_size) {
        (ValueEncoding::Signed, 1) => render_char(bits as u8 as i8 as i128),
        (ValueEncoding::Signed, 2) => (bits as u16 as i16).to_string(),
        (ValueEncoding::Signed, 4) => (bits as u32 as i32).to_string(),
        (ValueEncoding::Signed, 8) => (bits as u64 as i64).to_string(),
        (ValueEncoding::Signed, _) => (bits as i128).to_string(),
        (ValueEncoding::Unsigned, 1) => render_char(bits as u8 as i128),
        (ValueEncoding::Unsigned, _) => bits.to_string(),
        (ValueEncoding::Float, 4) => format!("{:?}", f32::from_bits(bits as u32)),
        (ValueEncoding::Float, 8) => format!("{:?}", f64::from_bits(bits as u64)),
        (ValueEncoding::Float, 16) => format!("{:?}", extended_to_f64(bits)),
        (ValueEncoding::Float, _) => format!("{bits:#x}"),
        (ValueEncoding::Pointer, _) => format!("{bits:#x}"),
    }
}

fn render_char(value: i128) -> String {
    let printable = (0x20..=0x7e).contains(&value);
    if printable {
        format!("{value} ('{}')", value as u8 as char)
    } else {
        value.to_string()
    }
}

/// Decode an x87 80-bit extended float stored in a 16-byte slot.
fn extended_to_f64(bits: u128) -> f64 {
    let mantissa = bits as u64;
    let sign_exp = (bits >> 64) as u16;
    let sign = if sign_exp & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = (sign_exp & 0x7fff) as i32;

    if exp == 0x7fff {
        return if mantissa << 1 == 0 {
            sign * f64::INFINITY
        } else {
            f64::NAN
        };
    }
    if exp == 0 && mantissa == 0 {
        return sign * 0.0;
    }

    // explicit integer bit, value = mantissa * 2^(exp - bias - 63)
    sign * mantissa as f64 * 2f64.powi(exp - 16383 - 63)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_signed_values() {
        assert_eq!(render_value(ValueEncoding::Signed, 4, u32::MAX as u128), "-1");
        assert_eq!(render_value(ValueEncoding::Signed, 4, 3), "3");
        assert_eq!(render_value(ValueEncoding::Signed, 2, 0xfffe), "-2");
        assert_eq!(
            render_value(ValueEncoding::Signed, 8, u64::MAX as u128),
            "-1"
        );
    }

    #[test]
    fn test_render_unsigned_values() {
        assert_eq!(render_value(ValueEncoding::Unsigned, 4, 42), "42");
        assert_eq!(
            render_value(ValueEncoding::Unsigned, 8, u64::MAX as u128),
            u64::MAX.to_string()
        );
    }

    #[test]
    fn test_render_printable_chars() {
        assert_eq!(render_value(ValueEncoding::Signed, 1, 97), "97 ('a')");
        assert_eq!(render_value(ValueEncoding::Unsigned, 1, 0x20), "32 (' ')");
        assert_eq!(render_value(ValueEncoding::Signed, 1, 7), "7");
        assert_eq!(render_value(ValueEncoding::Signed, 1, 0xff), "-1");
    }

    #[test]
    fn test_render_floats() {
        assert_eq!(
            render_value(ValueEncoding::Float, 4, 2.5f32.to_bits() as u128),
            "2.5"
        );
        assert_eq!(
            render_value(ValueEncoding::Float, 8, (-0.5f64).to_bits() as u128),
            "-0.5"
        );
    }

    #[test]
    fn test_render_pointers() {
        assert_eq!(render_value(ValueEncoding::Pointer, 8, 0xdead), "0xdead");
        assert_eq!(render_value(ValueEncoding::Pointer, 8, 0), "0x0");
    }

    #[test]
    fn test_extended_float_decode() {
        // 1.0 in x87 extended format: exponent = bias, explicit integer bit set
        let one = (16383u128 << 64) | (1u128 << 63);
        assert_eq!(extended_to_f64(one), 1.0);

        // -2.0
        let minus_two = ((0x8000u128 | 16384) << 64) | (1u128 << 63);
        assert_eq!(extended_to_f64(minus_two), -2.0);

        assert_eq!(extended_to_f64(0), 0.0);
    }

    #[test]
    fn test_canonical_zero() {
        assert_eq!(canonical_zero(ValueEncoding::Float), "0.0");
        assert_eq!(canonical_zero(ValueEncoding::Signed), "0");
        assert_eq!(canonical_zero(ValueEncoding::Pointer), "0");
    }

    #[test]
    fn test_filter() {
        let filter = VarFilter::Ignore(HashSet::from(["a".to_string(), "b".to_string()]));
        assert!(!filter.allows("a"));
        assert!(filter.allows("c"));

        let filter = VarFilter::Watch(HashSet::from(["a".to_string()]));
        assert!(filter.allows("a"));
        assert!(!filter.allows("c"));

        assert!(VarFilter::None.allows("anything"));
    }
}
