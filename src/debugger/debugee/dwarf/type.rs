use crate::debugger::debugee::dwarf::unit::{DieVariant, Unit};
use crate::debugger::register::PTR_SIZE;
use gimli::UnitOffset;
use smallvec::SmallVec;
use strum_macros::Display;

/// Maximum array dimensions the watcher can reverse-map.
pub const MAX_DIMENSIONS: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TypeClass {
    Scalar,
    Pointer,
    Enum,
    Array,
    Struct,
    Union,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueEncoding {
    Signed,
    Unsigned,
    Float,
    Pointer,
}

/// Shape of a watched array: row-major, last index fastest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayShape {
    pub element_size: u64,
    pub element_class: TypeClass,
    pub element_encoding: ValueEncoding,
    pub extents: SmallVec<[u64; MAX_DIMENSIONS]>,
}

impl ArrayShape {
    pub fn dimensions(&self) -> usize {
        self.extents.len()
    }

    pub fn element_count(&self) -> u64 {
        self.extents.iter().product()
    }
}

/// Flattened variable type: everything the watcher needs to read and diff a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeMeta {
    pub class: TypeClass,
    pub encoding: ValueEncoding,
    pub byte_size: u64,
    pub array: Option<ArrayShape>,
}

#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("unresolvable type reference")]
    BadReference,
    #[error("unsupported type construct")]
    Unsupported,
    #[error("array with unknown extent")]
    UnknownExtent,
    #[error("array has more than {MAX_DIMENSIONS} dimensions")]
    TooManyDimensions,
}

/// Resolve a variable type reference into a [`TypeMeta`], chasing typedef and
/// cv-qualifier chains down to a concrete type.
pub fn resolve(unit: &Unit, type_ref: UnitOffset) -> Result<TypeMeta, TypeError> {
    let entry_idx = chase(unit, type_ref)?;
    let entry = &unit.entries[entry_idx];

    match entry.die {
        DieVariant::BaseType(ref base) => {
            let byte_size = base.byte_size.ok_or(TypeError::Unsupported)?;
            Ok(TypeMeta {
                class: TypeClass::Scalar,
                encoding: base_type_encoding(base.encoding),
                byte_size,
                array: None,
            })
        }
        DieVariant::PointerType(ref ptr) => Ok(TypeMeta {
            class: TypeClass::Pointer,
            encoding: ValueEncoding::Pointer,
            byte_size: ptr.byte_size.unwrap_or(PTR_SIZE as u64),
            array: None,
        }),
        DieVariant::EnumType(ref enum_type) => {
            let byte_size = enum_type.byte_size.ok_or(TypeError::Unsupported)?;
            Ok(TypeMeta {
                class: TypeClass::Enum,
                encoding: ValueEncoding::Signed,
                byte_size,
                array: None,
            })
        }
        DieVariant::ArrayType(ref array) => {
            let element_ref = array.type_ref.ok_or(TypeError::BadReference)?;
            let element = resolve(unit, element_ref)?;
            if element.class == TypeClass::Array
                || element.class == TypeClass::Struct
                || element.class == TypeClass::Union
            {
                return Err(TypeError::Unsupported);
            }

            let mut extents: SmallVec<[u64; MAX_DIMENSIONS]> = SmallVec::new();
            for &child_idx in &entry.node.children {
                let DieVariant::ArraySubrange(ref subrange) = unit.entries[child_idx].die else {
                    continue;
                };
                // count and upper bound conventions differ by one
                let extent = match (subrange.count, subrange.upper_bound) {
                    (Some(count), _) => count,
                    (None, Some(upper_bound)) => upper_bound + 1,
                    (None, None) => return Err(TypeError::UnknownExtent),
                };
                if extents.len() == MAX_DIMENSIONS {
                    return Err(TypeError::TooManyDimensions);
                }
                extents.push(extent);
            }
            if extents.is_empty() {
                return Err(TypeError::UnknownExtent);
            }

            let byte_size = element.byte_size * extents.iter().product::<u64>();
            Ok(TypeMeta {
                class: TypeClass::Array,
                encoding: element.encoding,
                byte_size,
                array: Some(ArrayShape {
                    element_size: element.byte_size,
                    element_class: element.class,
                    element_encoding: element.encoding,
                    extents,
                }),
            })
        }
        DieVariant::StructType(ref st) => Ok(TypeMeta {
            class: TypeClass::Struct,
            encoding: ValueEncoding::Unsigned,
            byte_size: st.byte_size.unwrap_or(0),
            array: None,
        }),
        DieVariant::UnionType(ref un) => Ok(TypeMeta {
            class: TypeClass::Union,
            encoding: ValueEncoding::Unsigned,
            byte_size: un.byte_size.unwrap_or(0),
            array: None,
        }),
        _ => Err(TypeError::Unsupported),
    }
}

/// Follow typedef and modifier chains until a concrete type DIE.
fn chase(unit: &Unit, type_ref: UnitOffset) -> Result<usize, TypeError> {
    let mut offset = type_ref;
    // the chain length is bounded by the DIE count, a cycle means broken debug info
    for _ in 0..unit.entries.len() {
        let entry_idx = *unit
            .die_offsets_index
            .get(&offset)
            .ok_or(TypeError::BadReference)?;
        match unit.entries[entry_idx].die {
            DieVariant::Typedef(ref td) => {
                offset = td.type_ref.ok_or(TypeError::Unsupported)?;
            }
            DieVariant::Modifier(ref modifier) => {
                offset = modifier.type_ref.ok_or(TypeError::Unsupported)?;
            }
            _ => return Ok(entry_idx),
        }
    }
    Err(TypeError::BadReference)
}

fn base_type_encoding(encoding: Option<gimli::DwAte>) -> ValueEncoding {
    match encoding {
        Some(gimli::DW_ATE_signed) | Some(gimli::DW_ATE_signed_char) => ValueEncoding::Signed,
        Some(gimli::DW_ATE_float) => ValueEncoding::Float,
        Some(gimli::DW_ATE_unsigned)
        | Some(gimli::DW_ATE_unsigned_char)
        | Some(gimli::DW_ATE_boolean) => ValueEncoding::Unsigned,
        _ => ValueEncoding::Unsigned,
    }
}
