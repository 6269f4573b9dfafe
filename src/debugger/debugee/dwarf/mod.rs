pub mod r#type;
pub mod unit;

use crate::debugger::debugee::dwarf::r#type::{TypeClass, TypeMeta};
use crate::debugger::debugee::dwarf::unit::{DieVariant, DwarfUnitParser, Unit};
use crate::debugger::error::Error;
use crate::debugger::register::DWARF_BP;
use crate::debugger::variable::{Descriptor, Scope, ScopeSelection, VarFilter};
use fallible_iterator::FallibleIterator;
use gimli::{
    Attribute, AttributeValue, Expression, LocationListsOffset, Operation, RunTimeEndian,
    SectionId,
};
use log::{debug, warn};
use object::{Object, ObjectSection};
use std::borrow::Cow;
use std::path::PathBuf;
use std::rc::Rc;
use strum_macros::Display;

pub type EndianRcSlice = gimli::EndianRcSlice<gimli::RunTimeEndian>;

/// One line-table record inside the traced function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line {
    pub addr: usize,
    /// 1-based source line number.
    pub number: u64,
    /// Record marks the first instruction of a source statement.
    pub is_stmt: bool,
    pub basic_block: bool,
    pub end_sequence: bool,
}

/// Source language of a compilation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Language {
    C89,
    C99,
    C11,
    Other,
}

/// The traced function, resolved from a subprogram DIE.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// First byte of the function code.
    pub low_pc: usize,
    /// Last byte of the function code (inclusive).
    pub high_pc: usize,
    unit_idx: usize,
    die_idx: usize,
}

/// Parsed debug information of the whole debugee image. Immutable once built.
pub struct DebugInformation {
    inner: gimli::Dwarf<EndianRcSlice>,
    units: Vec<Unit>,
}

fn load_section(
    id: SectionId,
    file: &object::File,
    endian: RunTimeEndian,
) -> Result<EndianRcSlice, Error> {
    let data = file
        .section_by_name(id.name())
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[]));
    Ok(gimli::EndianRcSlice::new(Rc::from(&*data), endian))
}

impl DebugInformation {
    pub fn from_file(file: &object::File) -> Result<Self, Error> {
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let dwarf = gimli::Dwarf::load(|id| load_section(id, file, endian))?;

        let parser = DwarfUnitParser::new(&dwarf);
        let headers = dwarf.units().collect::<Vec<_>>()?;
        let units = headers
            .into_iter()
            .map(|header| parser.parse(dwarf.unit(header)?))
            .collect::<gimli::Result<Vec<_>>>()?;

        if units.is_empty() {
            return Err(Error::NoDebugInformation("file"));
        }

        Ok(Self {
            inner: dwarf,
            units,
        })
    }

    /// Find a subprogram DIE with given name, returning the resolved code range.
    pub fn find_function(&self, name: &str) -> Result<Function, Error> {
        for (unit_idx, unit) in self.units.iter().enumerate() {
            let Some(die_idx) = unit.find_function(name) else {
                continue;
            };
            let DieVariant::Function(ref die) = unit.entries[die_idx].die else {
                continue;
            };
            let (Some(low_pc), Some(high_pc)) = (die.low_pc, die.high_pc) else {
                // a declaration, keep searching for the definition
                continue;
            };

            return Ok(Function {
                name: name.to_string(),
                low_pc: low_pc as usize,
                // make the range inclusive of the last covered byte
                high_pc: (high_pc - 1) as usize,
                unit_idx,
                die_idx,
            });
        }

        Err(Error::FunctionNotFound(name.to_string()))
    }

    /// Source language of the unit the function belongs to.
    pub fn language(&self, function: &Function) -> Language {
        match self.units[function.unit_idx].language() {
            Some(gimli::DW_LANG_C89) | Some(gimli::DW_LANG_C) => Language::C89,
            Some(gimli::DW_LANG_C99) => Language::C99,
            Some(gimli::DW_LANG_C11) => Language::C11,
            _ => Language::Other,
        }
    }

    /// Signed offset added to the runtime base pointer to reach the frame base.
    ///
    /// Supports the two conventions compilers emit for a function with a frame
    /// pointer: a location list with a base-pointer-relative entry for the
    /// function body, or a single register-direct expression.
    pub fn frame_base_offset(&self, function: &Function) -> Result<i64, Error> {
        let unit = &self.units[function.unit_idx];
        let DieVariant::Function(ref die) = unit.entries[function.die_idx].die else {
            return Err(Error::FunctionNotFound(function.name.clone()));
        };
        let fb_attr = die
            .fb_attr
            .as_ref()
            .ok_or_else(|| Error::NoFramePointer(function.name.clone()))?;

        if let Some(expr) = fb_attr.exprloc_value() {
            return match frame_base_rule(expr, unit.encoding) {
                Some(FrameBaseRule::RegisterDirect) => Ok(0),
                Some(FrameBaseRule::RegisterOffset(offset)) => Ok(offset),
                None => Err(Error::NoFramePointer(function.name.clone())),
            };
        }

        let Some(offset) = loclist_offset(fb_attr) else {
            return Err(Error::NoFramePointer(function.name.clone()));
        };
        let gimli_unit = self.gimli_unit(unit)?;
        let mut entries = self.inner.locations(&gimli_unit, offset)?;
        let mut register_direct_seen = false;
        while let Some(entry) = entries.next()? {
            match frame_base_rule(entry.data, unit.encoding) {
                Some(FrameBaseRule::RegisterOffset(offset)) => return Ok(offset),
                Some(FrameBaseRule::RegisterDirect) => register_direct_seen = true,
                None => {}
            }
        }

        if register_direct_seen {
            Ok(0)
        } else {
            Err(Error::NoFramePointer(function.name.clone()))
        }
    }

    /// Emit descriptors of every watchable variable: globals with static storage
    /// across all compilation units plus base-pointer-relative locals of the
    /// traced function. Struct and union objects are recognised and skipped,
    /// unsupported locations and sizes are dropped with a diagnostic.
    pub fn variables(
        &self,
        function: &Function,
        frame_base_offset: i64,
        filter: &VarFilter,
        selection: ScopeSelection,
    ) -> Vec<Descriptor> {
        let mut result = vec![];

        if selection != ScopeSelection::OnlyLocals {
            for unit in &self.units {
                for entry in &unit.entries {
                    let DieVariant::Variable(ref die) = entry.die else {
                        continue;
                    };
                    let Some(ref name) = die.base_attributes.name else {
                        continue;
                    };
                    if !filter.allows(name) {
                        continue;
                    }
                    let Some(ref location) = die.location else {
                        continue;
                    };
                    let Some(Operation::Address { address }) =
                        first_location_op(location, unit.encoding)
                    else {
                        continue;
                    };
                    let Some(type_meta) = self.classify(unit, die.type_ref, name) else {
                        continue;
                    };
                    result.push(Descriptor {
                        name: name.clone(),
                        scope: Scope::Global {
                            addr: address as usize,
                        },
                        type_meta,
                    });
                }
            }
        }

        if selection != ScopeSelection::OnlyGlobals {
            let unit = &self.units[function.unit_idx];
            let fn_entry = &unit.entries[function.die_idx];
            for &child_idx in &fn_entry.node.children {
                let entry = &unit.entries[child_idx];
                let (name, type_ref, location) = match entry.die {
                    DieVariant::Variable(ref die) => (
                        die.base_attributes.name.as_ref(),
                        die.type_ref,
                        die.location.as_ref(),
                    ),
                    DieVariant::Parameter(ref die) => (
                        die.base_attributes.name.as_ref(),
                        die.type_ref,
                        die.location.as_ref(),
                    ),
                    _ => continue,
                };
                let Some(name) = name else { continue };
                if !filter.allows(name) {
                    continue;
                }
                let Some(location) = location else { continue };

                let offset = match first_location_op(location, unit.encoding) {
                    Some(Operation::FrameOffset { offset }) => frame_base_offset + offset,
                    Some(Operation::RegisterOffset {
                        register, offset, ..
                    }) if register == DWARF_BP => offset,
                    // static storage locals are emitted by the globals pass
                    Some(Operation::Address { .. }) => continue,
                    _ => {
                        warn!(target: "debugger", "variable `{name}`: unsupported location expression, dropped");
                        continue;
                    }
                };

                let Some(type_meta) = self.classify(unit, type_ref, name) else {
                    continue;
                };
                result.push(Descriptor {
                    name: name.clone(),
                    scope: Scope::Local { offset },
                    type_meta,
                });
            }
        }

        result
    }

    /// Resolve and vet a variable type. `None` means the variable must not be watched.
    fn classify(
        &self,
        unit: &Unit,
        type_ref: Option<gimli::UnitOffset>,
        name: &str,
    ) -> Option<TypeMeta> {
        let Some(type_ref) = type_ref else {
            warn!(target: "debugger", "variable `{name}`: no type reference, dropped");
            return None;
        };
        let type_meta = match r#type::resolve(unit, type_ref) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(target: "debugger", "variable `{name}`: {e}, dropped");
                return None;
            }
        };

        match type_meta.class {
            TypeClass::Struct | TypeClass::Union => {
                debug!(target: "debugger", "variable `{name}` is a {}, skipped", type_meta.class);
                None
            }
            TypeClass::Array => {
                let element_size = type_meta.array.as_ref().expect("array has a shape").element_size;
                if !matches!(element_size, 1 | 2 | 4 | 8 | 16) {
                    warn!(target: "debugger", "variable `{name}`: unsupported element size {element_size}, dropped");
                    return None;
                }
                Some(type_meta)
            }
            TypeClass::Scalar | TypeClass::Pointer | TypeClass::Enum => {
                if !matches!(type_meta.byte_size, 1 | 2 | 4 | 8 | 16) {
                    warn!(
                        target: "debugger",
                        "variable `{name}`: unsupported size {}, dropped", type_meta.byte_size
                    );
                    return None;
                }
                Some(type_meta)
            }
        }
    }

    /// Statement-start records of the function, ordered by address.
    pub fn function_lines(&self, function: &Function) -> Vec<Line> {
        self.units[function.unit_idx].lines_in_range(function.low_pc, function.high_pc)
    }

    /// Path of the source file the function was compiled from.
    pub fn source_file(&self, function: &Function) -> Option<PathBuf> {
        self.units[function.unit_idx].source_file()
    }

    /// Re-create the gimli unit a parsed unit was built from.
    fn gimli_unit(&self, parsed: &Unit) -> Result<gimli::Unit<EndianRcSlice>, Error> {
        let mut headers = self.inner.units();
        while let Some(header) = headers.next()? {
            if header.offset().as_debug_info_offset() == parsed.offset() {
                return Ok(self.inner.unit(header)?);
            }
        }
        Err(Error::NoDebugInformation("compilation unit"))
    }
}

enum FrameBaseRule {
    RegisterDirect,
    RegisterOffset(i64),
}

fn frame_base_rule(
    expr: Expression<EndianRcSlice>,
    encoding: gimli::Encoding,
) -> Option<FrameBaseRule> {
    let mut ops = expr.operations(encoding);
    match ops.next().ok().flatten()? {
        Operation::Register { register } if register == DWARF_BP => {
            Some(FrameBaseRule::RegisterDirect)
        }
        Operation::RegisterOffset {
            register, offset, ..
        } if register == DWARF_BP => Some(FrameBaseRule::RegisterOffset(offset)),
        _ => None,
    }
}

fn first_location_op(
    attr: &Attribute<EndianRcSlice>,
    encoding: gimli::Encoding,
) -> Option<Operation<EndianRcSlice>> {
    let expr = attr.exprloc_value()?;
    expr.operations(encoding).next().ok().flatten()
}

fn loclist_offset(attr: &Attribute<EndianRcSlice>) -> Option<LocationListsOffset> {
    match attr.value() {
        AttributeValue::LocationListsRef(offset) => Some(offset),
        AttributeValue::SecOffset(offset) => Some(LocationListsOffset(offset)),
        AttributeValue::Data4(offset) => Some(LocationListsOffset(offset as usize)),
        AttributeValue::Data8(offset) => Some(LocationListsOffset(offset as usize)),
        _ => None,
    }
}
