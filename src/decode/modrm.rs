//! ModRM/SIB/REX bitfields.
//!
//! These map 1:1 onto the x86 manual's bit layouts. `bitfield-struct` gives
//! named accessors over a packed byte instead of hand-written shift/mask
//! boilerplate.

use bitfield_struct::bitfield;

/// REX prefix (0x40-0x4F in 64-bit mode).
#[bitfield(u8)]
pub struct Rex {
    pub b: bool,
    pub x: bool,
    pub r: bool,
    pub w: bool,
    #[bits(4)]
    __fixed: u8,
}

impl Rex {
    pub const TAG_MASK: u8 = 0xf0;
    pub const TAG: u8 = 0x40;
    pub fn is_rex_byte(byte: u8) -> bool {
        byte & Self::TAG_MASK == Self::TAG
    }
}

#[bitfield(u8)]
pub struct ModRmByte {
    #[bits(3)]
    pub rm: u8,
    #[bits(3)]
    pub reg: u8,
    #[bits(2)]
    pub md: u8,
}

#[bitfield(u8)]
pub struct SibByte {
    #[bits(3)]
    pub base: u8,
    #[bits(3)]
    pub index: u8,
    #[bits(2)]
    pub scale: u8,
}

/// A decoded ModRM (+ SIB + displacement), with REX's R/X/B extension bits
/// already folded into the register numbers.
#[derive(Clone, Copy, Debug)]
pub struct ModRm {
    pub reg: u8,
    pub is_reg_operand: bool,
    pub rm_reg: u8,
    pub base: Option<u8>,
    pub index: Option<(u8, u8)>,
    pub disp: i32,
    pub rip_relative: bool,
    pub len: usize,
}

/// Parse ModRM (+SIB +disp) starting at `bytes[0]`. `rex` supplies the
/// R/X/B extension bits (all false outside 64-bit mode or absent REX).
pub fn parse_modrm(bytes: &[u8], rex: Rex, addr32: bool) -> Option<ModRm> {
    if bytes.is_empty() {
        return None;
    }
    let modrm = ModRmByte::from(bytes[0]);
    let reg = modrm.reg() | ((rex.r() as u8) << 3);
    let mut len = 1;

    if modrm.md() == 0b11 {
        let rm_reg = modrm.rm() | ((rex.b() as u8) << 3);
        return Some(ModRm {
            reg,
            is_reg_operand: true,
            rm_reg,
            base: None,
            index: None,
            disp: 0,
            rip_relative: false,
            len,
        });
    }

    let mut base = None;
    let mut index = None;
    let mut rip_relative = false;

    if modrm.rm() == 0b100 && !addr32 {
        // SIB byte follows.
        let sib = SibByte::from(*bytes.get(len)?);
        len += 1;
        let idx = sib.index() | ((rex.x() as u8) << 3);
        if !(idx == 0b100 && !rex.x()) {
            index = Some((idx, sib.scale()));
        }
        if sib.base() == 0b101 && modrm.md() == 0b00 {
            base = None; // disp32, no base
        } else {
            base = Some(sib.base() | ((rex.b() as u8) << 3));
        }
    } else if modrm.rm() == 0b101 && modrm.md() == 0b00 {
        rip_relative = true;
    } else {
        base = Some(modrm.rm() | ((rex.b() as u8) << 3));
    }

    let disp = match modrm.md() {
        0b00 => {
            if rip_relative || (modrm.rm() == 0b100 && base.is_none()) {
                let d = i32::from_le_bytes(bytes.get(len..len + 4)?.try_into().ok()?);
                len += 4;
                d
            } else {
                0
            }
        }
        0b01 => {
            let d = *bytes.get(len)? as i8 as i32;
            len += 1;
            d
        }
        0b10 => {
            let d = i32::from_le_bytes(bytes.get(len..len + 4)?.try_into().ok()?);
            len += 4;
            d
        }
        _ => unreachable!(),
    };

    Some(ModRm {
        reg,
        is_reg_operand: false,
        rm_reg: 0,
        base,
        index,
        disp,
        rip_relative,
        len,
    })
}
