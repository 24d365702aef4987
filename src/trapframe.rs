//! Trap frame and the register state a syscall or fault crosses the
//! user/kernel boundary with.
use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes};

bitflags! {
    /// The subset of EFLAGS a user process is allowed to load directly.
    ///
    /// `PUT` masks an incoming trap frame's EFLAGS against this set before
    /// installing it in a child: `IF`, `IOPL` and the trap/resume bits never
    /// come from a parent-supplied register blob.
    pub struct EflagsFlags: u32 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const DF = 1 << 10;
        const OF = 1 << 11;
        /// Always-on bit 1 of EFLAGS; not settable or clearable, but part of
        /// every frame the kernel constructs.
        const RESERVED = 1 << 1;
        /// Interrupt-enable flag; only the kernel ever sets this, never a
        /// value taken verbatim from user-supplied registers.
        const IF = 1 << 9;
    }
}

/// `FL_USER`: exactly the condition-code and arithmetic flags a user process
/// may control. Used to mask `PUT`'s incoming register blob before it is
/// written into a child's trap frame.
pub const FL_USER: EflagsFlags = EflagsFlags::from_bits_truncate(
    EflagsFlags::CF.bits()
        | EflagsFlags::PF.bits()
        | EflagsFlags::AF.bits()
        | EflagsFlags::ZF.bits()
        | EflagsFlags::SF.bits()
        | EflagsFlags::DF.bits()
        | EflagsFlags::OF.bits(),
);

/// Canonical ring-3 code selector (GDT index 3, RPL 3): `PUT` forces every
/// child's `cs` to this value rather than trusting a parent-supplied one.
pub const USER_CODE_SELECTOR: u16 = (3 << 3) | 3;

/// Canonical ring-3 data selector (GDT index 4, RPL 3), used for `ds`/`es`/`ss`.
pub const USER_DATA_SELECTOR: u16 = (4 << 3) | 3;

/// General-purpose registers pushed by the trap entry stub, in the same
/// order as a real `pusha`/`pushal` sequence would leave them on the stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes)]
#[repr(C)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// The complete machine state saved on a trap: general registers, segment
/// selectors, the faulting instruction pointer, and the interrupted flags.
///
/// Every 16-bit selector is followed by an explicit `u16` padding field so
/// the `#[repr(C)]` layout has no implicit gaps: `AsBytes` refuses to derive
/// over a struct the compiler would otherwise pad itself.
///
/// `PUT`/`GET` exchange the `regs`, `fs`/`gs`, and the user-controllable part
/// of `eflags` between parent and child; the kernel-private fields
/// (`trapno`, `err`, `cs`, `eip`) are the kernel's own bookkeeping and are
/// never copied from a parent-supplied blob without going through the checks
/// in [`crate::syscall`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes)]
#[repr(C)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub es: u16,
    pub padding1: u16,
    pub ds: u16,
    pub padding2: u16,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub padding3: u16,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
    pub padding4: u16,
    pub fs: u16,
    pub padding5: u16,
    pub gs: u16,
    pub padding6: u16,
}

impl TrapFrame {
    /// Returns `eflags` with only the `FL_USER` bits set, discarding
    /// anything else a parent-supplied register blob might have set.
    pub fn user_eflags(&self) -> EflagsFlags {
        EflagsFlags::from_bits_truncate(self.eflags) & FL_USER
    }

    /// Replaces the `FL_USER` bits of `eflags` with `flags`, leaving every
    /// other bit (in particular `IF`) untouched.
    pub fn set_user_eflags(&mut self, flags: EflagsFlags) {
        let preserved = EflagsFlags::from_bits_truncate(self.eflags) & !FL_USER;
        self.eflags = (preserved | (flags & FL_USER)).bits();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fl_user_excludes_if_and_iopl() {
        assert!(!FL_USER.contains(EflagsFlags::IF));
        assert!(!FL_USER.contains(EflagsFlags::RESERVED));
    }

    #[test]
    fn set_user_eflags_preserves_if() {
        let mut tf = TrapFrame {
            eflags: EflagsFlags::IF.bits(),
            ..Default::default()
        };
        tf.set_user_eflags(EflagsFlags::CF | EflagsFlags::ZF);
        let got = EflagsFlags::from_bits_truncate(tf.eflags);
        assert!(got.contains(EflagsFlags::IF));
        assert!(got.contains(EflagsFlags::CF));
        assert!(got.contains(EflagsFlags::ZF));
        assert!(!got.contains(EflagsFlags::OF));
    }

    #[test]
    fn user_eflags_masks_out_kernel_bits() {
        let tf = TrapFrame {
            eflags: (EflagsFlags::IF | EflagsFlags::CF | EflagsFlags::RESERVED).bits(),
            ..Default::default()
        };
        assert_eq!(tf.user_eflags(), EflagsFlags::CF);
    }
}
