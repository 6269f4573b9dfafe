use crate::debugger::debugee::dwarf::{EndianRcSlice, Line};
use gimli::{
    Attribute, AttributeValue, DebugInfoOffset, DwAte, DwLang, Reader, Unit as DwarfUnit,
    UnitOffset, DW_AT_byte_size, DW_AT_count, DW_AT_encoding, DW_AT_frame_base, DW_AT_high_pc,
    DW_AT_language, DW_AT_location, DW_AT_low_pc, DW_AT_lower_bound, DW_AT_name, DW_AT_type,
    DW_AT_upper_bound,
};
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::path::PathBuf;

#[derive(PartialEq, Debug)]
pub(super) struct LineRow {
    pub(super) address: u64,
    pub(super) line: u64,
    pub(super) is_stmt: bool,
    pub(super) basic_block: bool,
    pub(super) end_sequence: bool,
}

/// One parsed compilation unit: flattened DIE tree plus the line program.
#[derive(Debug)]
pub struct Unit {
    pub(super) name: Option<String>,
    pub(super) comp_dir: Option<String>,
    pub(super) language: Option<DwLang>,
    pub(super) encoding: gimli::Encoding,
    pub(super) offset: Option<DebugInfoOffset>,
    pub(super) lines: Vec<LineRow>,
    pub entries: Vec<Entry>,
    // index for function die position: function name -> position in unit entries
    pub(super) function_index: HashMap<String, usize>,
    // index for die offsets: offset in unit -> position in unit entries
    pub(super) die_offsets_index: HashMap<UnitOffset, usize>,
}

impl Unit {
    pub fn offset(&self) -> Option<DebugInfoOffset> {
        self.offset
    }

    pub fn language(&self) -> Option<DwLang> {
        self.language
    }

    /// Source file of this unit: DW_AT_comp_dir joined with DW_AT_name.
    pub fn source_file(&self) -> Option<PathBuf> {
        let name = self.name.as_ref()?;
        let name = PathBuf::from(name);
        if name.is_absolute() {
            return Some(name);
        }
        match self.comp_dir {
            Some(ref comp_dir) => Some(PathBuf::from(comp_dir).join(name)),
            None => Some(name),
        }
    }

    pub fn find_function(&self, name: &str) -> Option<usize> {
        self.function_index.get(name).copied()
    }

    pub fn find_entry(&self, offset: UnitOffset) -> Option<&Entry> {
        let die_idx = self.die_offsets_index.get(&offset)?;
        Some(&self.entries[*die_idx])
    }

    /// Statement records whose address lies in `low..=high`, ordered by address.
    pub fn lines_in_range(&self, low: usize, high: usize) -> Vec<Line> {
        self.lines
            .iter()
            .filter(|row| (low..=high).contains(&(row.address as usize)))
            .map(|row| Line {
                addr: row.address as usize,
                number: row.line,
                is_stmt: row.is_stmt,
                basic_block: row.basic_block,
                end_sequence: row.end_sequence,
            })
            .collect()
    }
}

#[derive(Debug, PartialEq)]
pub struct DieAttributes {
    pub name: Option<String>,
}

#[derive(Debug)]
pub struct FunctionDie {
    pub base_attributes: DieAttributes,
    pub low_pc: Option<u64>,
    pub high_pc: Option<u64>,
    pub fb_attr: Option<Attribute<EndianRcSlice>>,
}

#[derive(Debug)]
pub struct LexicalBlockDie {
    pub base_attributes: DieAttributes,
}

#[derive(Debug)]
pub struct VariableDie {
    pub base_attributes: DieAttributes,
    pub type_ref: Option<UnitOffset>,
    pub location: Option<Attribute<EndianRcSlice>>,
}

#[derive(Debug)]
pub struct ParameterDie {
    pub base_attributes: DieAttributes,
    pub type_ref: Option<UnitOffset>,
    pub location: Option<Attribute<EndianRcSlice>>,
}

#[derive(Debug)]
pub struct BaseTypeDie {
    pub base_attributes: DieAttributes,
    pub encoding: Option<DwAte>,
    pub byte_size: Option<u64>,
}

#[derive(Debug)]
pub struct TypedefDie {
    pub base_attributes: DieAttributes,
    pub type_ref: Option<UnitOffset>,
}

/// Const/volatile/restrict wrapper, transparent for classification.
#[derive(Debug)]
pub struct ModifierDie {
    pub base_attributes: DieAttributes,
    pub type_ref: Option<UnitOffset>,
}

#[derive(Debug)]
pub struct PointerTypeDie {
    pub base_attributes: DieAttributes,
    pub byte_size: Option<u64>,
}

#[derive(Debug)]
pub struct ArrayTypeDie {
    pub base_attributes: DieAttributes,
    pub type_ref: Option<UnitOffset>,
    pub byte_size: Option<u64>,
}

#[derive(Debug)]
pub struct ArraySubrangeDie {
    pub base_attributes: DieAttributes,
    pub lower_bound: Option<u64>,
    pub upper_bound: Option<u64>,
    pub count: Option<u64>,
}

#[derive(Debug)]
pub struct EnumTypeDie {
    pub base_attributes: DieAttributes,
    pub byte_size: Option<u64>,
}

#[derive(Debug)]
pub struct StructTypeDie {
    pub base_attributes: DieAttributes,
    pub byte_size: Option<u64>,
}

#[derive(Debug)]
pub struct UnionTypeDie {
    pub base_attributes: DieAttributes,
    pub byte_size: Option<u64>,
}

#[derive(Debug)]
pub enum DieVariant {
    Function(FunctionDie),
    LexicalBlock(LexicalBlockDie),
    Variable(VariableDie),
    Parameter(ParameterDie),
    BaseType(BaseTypeDie),
    Typedef(TypedefDie),
    Modifier(ModifierDie),
    PointerType(PointerTypeDie),
    ArrayType(ArrayTypeDie),
    ArraySubrange(ArraySubrangeDie),
    EnumType(EnumTypeDie),
    StructType(StructTypeDie),
    UnionType(UnionTypeDie),
    Default(DieAttributes),
}

#[derive(Debug)]
pub struct Node {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

#[derive(Debug)]
pub struct Entry {
    pub die: DieVariant,
    pub node: Node,
}

impl Entry {
    fn new(die: DieVariant, parent_idx: Option<usize>) -> Self {
        Self {
            die,
            node: Node {
                parent: parent_idx,
                children: vec![],
            },
        }
    }
}

pub struct DwarfUnitParser<'a> {
    dwarf: &'a gimli::Dwarf<EndianRcSlice>,
}

impl<'a> DwarfUnitParser<'a> {
    pub fn new(dwarf: &'a gimli::Dwarf<EndianRcSlice>) -> Self {
        Self { dwarf }
    }

    fn die_string(
        &self,
        unit: &DwarfUnit<EndianRcSlice>,
        attr: Option<Attribute<EndianRcSlice>>,
    ) -> Option<String> {
        let attr = attr?;
        let value = self.dwarf.attr_string(unit, attr.value()).ok()?;
        value.to_string_lossy().ok().map(|s| s.to_string())
    }

    pub fn parse(&self, unit: DwarfUnit<EndianRcSlice>) -> gimli::Result<Unit> {
        let name = unit
            .name
            .as_ref()
            .and_then(|n| n.to_string_lossy().ok().map(|s| s.to_string()));
        let comp_dir = unit
            .comp_dir
            .as_ref()
            .and_then(|d| d.to_string_lossy().ok().map(|s| s.to_string()));

        let mut parsed_unit = Unit {
            name,
            comp_dir,
            language: None,
            encoding: unit.encoding(),
            offset: unit.header.offset().as_debug_info_offset(),
            lines: vec![],
            entries: vec![],
            function_index: HashMap::new(),
            die_offsets_index: HashMap::new(),
        };

        let unit = &unit;

        if let Some(ref lp) = unit.line_program {
            let mut rows = lp.clone().rows();
            parsed_unit.lines = parse_lines(&mut rows)?;
        }
        parsed_unit.lines.sort_unstable_by_key(|x| x.address);

        let mut cursor = unit.entries();
        // the chain of indices leading to the DIE under the cursor, one entry
        // per tree level; `next_dfs` reports how far the cursor moved vertically
        let mut ancestors: Vec<usize> = vec![];
        let mut depth = 0isize;
        while let Some((delta_depth, die)) = cursor.next_dfs()? {
            depth += delta_depth;
            ancestors.truncate(depth as usize);
            let parent_idx = ancestors.last().copied();

            let die_idx = parsed_unit.entries.len();
            if let Some(parent_idx) = parent_idx {
                parsed_unit.entries[parent_idx].node.children.push(die_idx)
            }

            if parsed_unit.language.is_none() {
                if let Some(AttributeValue::Language(lang)) =
                    die.attr(DW_AT_language)?.map(|attr| attr.value())
                {
                    parsed_unit.language = Some(lang);
                }
            }

            let base_attrs = DieAttributes {
                name: self.die_string(unit, die.attr(DW_AT_name)?),
            };

            let parsed_die = match die.tag() {
                gimli::DW_TAG_subprogram => {
                    let low_pc = die.attr(DW_AT_low_pc)?.and_then(|attr| {
                        if let AttributeValue::Addr(addr) = attr.value() {
                            Some(addr)
                        } else {
                            None
                        }
                    });
                    // high_pc is either an address or, in the DWARF-4 data form,
                    // an offset from low_pc
                    let high_pc = die.attr(DW_AT_high_pc)?.and_then(|attr| match attr.value() {
                        AttributeValue::Addr(addr) => Some(addr),
                        _ => attr
                            .udata_value()
                            .and_then(|offset| Some(low_pc? + offset)),
                    });

                    let die = FunctionDie {
                        base_attributes: base_attrs,
                        low_pc,
                        high_pc,
                        fb_attr: die.attr(DW_AT_frame_base)?,
                    };

                    if let Some(ref name) = die.base_attributes.name {
                        parsed_unit
                            .function_index
                            .entry(name.to_string())
                            .or_insert(die_idx);
                    }

                    DieVariant::Function(die)
                }
                gimli::DW_TAG_formal_parameter => DieVariant::Parameter(ParameterDie {
                    base_attributes: base_attrs,
                    type_ref: die.attr(DW_AT_type)?.and_then(unit_ref),
                    location: die.attr(DW_AT_location)?,
                }),
                gimli::DW_TAG_variable => DieVariant::Variable(VariableDie {
                    base_attributes: base_attrs,
                    type_ref: die.attr(DW_AT_type)?.and_then(unit_ref),
                    location: die.attr(DW_AT_location)?,
                }),
                gimli::DW_TAG_base_type => {
                    let encoding = die.attr(DW_AT_encoding)?.and_then(|attr| {
                        if let AttributeValue::Encoding(enc) = attr.value() {
                            Some(enc)
                        } else {
                            None
                        }
                    });

                    DieVariant::BaseType(BaseTypeDie {
                        base_attributes: base_attrs,
                        encoding,
                        byte_size: die.attr(DW_AT_byte_size)?.and_then(|val| val.udata_value()),
                    })
                }
                gimli::DW_TAG_typedef => DieVariant::Typedef(TypedefDie {
                    base_attributes: base_attrs,
                    type_ref: die.attr(DW_AT_type)?.and_then(unit_ref),
                }),
                gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type
                | gimli::DW_TAG_restrict_type => DieVariant::Modifier(ModifierDie {
                    base_attributes: base_attrs,
                    type_ref: die.attr(DW_AT_type)?.and_then(unit_ref),
                }),
                gimli::DW_TAG_pointer_type => DieVariant::PointerType(PointerTypeDie {
                    base_attributes: base_attrs,
                    byte_size: die.attr(DW_AT_byte_size)?.and_then(|val| val.udata_value()),
                }),
                gimli::DW_TAG_array_type => DieVariant::ArrayType(ArrayTypeDie {
                    base_attributes: base_attrs,
                    type_ref: die.attr(DW_AT_type)?.and_then(unit_ref),
                    byte_size: die.attr(DW_AT_byte_size)?.and_then(|val| val.udata_value()),
                }),
                gimli::DW_TAG_subrange_type => DieVariant::ArraySubrange(ArraySubrangeDie {
                    base_attributes: base_attrs,
                    lower_bound: die
                        .attr(DW_AT_lower_bound)?
                        .and_then(|val| val.udata_value()),
                    upper_bound: die
                        .attr(DW_AT_upper_bound)?
                        .and_then(|val| val.udata_value()),
                    count: die.attr(DW_AT_count)?.and_then(|val| val.udata_value()),
                }),
                gimli::DW_TAG_enumeration_type => DieVariant::EnumType(EnumTypeDie {
                    base_attributes: base_attrs,
                    byte_size: die.attr(DW_AT_byte_size)?.and_then(|val| val.udata_value()),
                }),
                gimli::DW_TAG_structure_type => DieVariant::StructType(StructTypeDie {
                    base_attributes: base_attrs,
                    byte_size: die.attr(DW_AT_byte_size)?.and_then(|val| val.udata_value()),
                }),
                gimli::DW_TAG_union_type => DieVariant::UnionType(UnionTypeDie {
                    base_attributes: base_attrs,
                    byte_size: die.attr(DW_AT_byte_size)?.and_then(|val| val.udata_value()),
                }),
                gimli::DW_TAG_lexical_block => DieVariant::LexicalBlock(LexicalBlockDie {
                    base_attributes: base_attrs,
                }),
                _ => DieVariant::Default(base_attrs),
            };

            parsed_unit.entries.push(Entry::new(parsed_die, parent_idx));
            parsed_unit.die_offsets_index.insert(die.offset(), die_idx);
            ancestors.push(die_idx);
        }

        Ok(parsed_unit)
    }
}

fn unit_ref(attr: Attribute<EndianRcSlice>) -> Option<UnitOffset> {
    match attr.value() {
        AttributeValue::UnitRef(offset) => Some(offset),
        _ => None,
    }
}

fn parse_lines<R, Offset>(
    rows: &mut gimli::LineRows<R, gimli::IncompleteLineProgram<R, Offset>, Offset>,
) -> gimli::Result<Vec<LineRow>>
where
    R: gimli::Reader<Offset = Offset>,
    Offset: gimli::ReaderOffset,
{
    let mut lines = vec![];
    while let Some((_, line_row)) = rows.next_row()? {
        lines.push(LineRow {
            address: line_row.address(),
            line: line_row.line().map(NonZeroU64::get).unwrap_or(0),
            is_stmt: line_row.is_stmt(),
            basic_block: line_row.basic_block(),
            end_sequence: line_row.end_sequence(),
        })
    }
    Ok(lines)
}
