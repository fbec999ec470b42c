//! # Backtrace Module
//!
//! Call frames as shown in the backtrace view, and a frame pointer walk to reconstruct them.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::addr::Addr;
use crate::analysis::SymbolTable;
use crate::errors::Result;

/// One frame of a backtrace, index 0 being the innermost
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    pub index: usize,
    pub addr: Addr,
    pub name: Option<String>,
}

impl Display for CallFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{:<3} {} in {}",
            self.index,
            self.addr,
            self.name.as_deref().unwrap_or("??")
        )
    }
}

/// Walks the chain of saved frame pointers
///
/// Frame `n+1` returns to the word after the saved frame pointer of frame `n`. The walk stops
/// at a null frame pointer, a null return address, a frame pointer that does not grow towards
/// the stack base, a failed read, or after `max_frames` frames.
pub fn walk_frames<R>(
    ip: Addr,
    fp: Addr,
    pointer_width: usize,
    symbols: &SymbolTable,
    max_frames: usize,
    mut read_word: R,
) -> Vec<CallFrame>
where
    R: FnMut(Addr) -> Result<u64>,
{
    let name_of = |addr: Addr| symbols.lookup(addr).map(|s| s.name.clone());
    let mut frames = vec![CallFrame {
        index: 0,
        addr: ip,
        name: name_of(ip),
    }];

    let mut fp = fp;
    while frames.len() < max_frames && fp.u64() != 0 {
        let Some(ret_slot) = fp.checked_offset(pointer_width as i64) else {
            break;
        };
        let (Ok(ret), Ok(next_fp)) = (read_word(ret_slot), read_word(fp)) else {
            trace!("could not read the frame at {fp}");
            break;
        };
        if ret == 0 {
            break;
        }
        let ret = Addr::from(ret);
        frames.push(CallFrame {
            index: frames.len(),
            addr: ret,
            name: name_of(ret),
        });
        let next_fp = Addr::from(next_fp);
        if next_fp <= fp {
            break;
        }
        fp = next_fp;
    }

    frames
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::analysis::Symbol;
    use crate::errors::LiveError;

    fn symbols() -> SymbolTable {
        SymbolTable::new(vec![
            Symbol {
                name: "inner".to_string(),
                start: Addr::new(0x1000),
                size: 0x100,
            },
            Symbol {
                name: "main".to_string(),
                start: Addr::new(0x2000),
                size: 0x100,
            },
        ])
    }

    fn reader(mem: HashMap<u64, u64>) -> impl FnMut(Addr) -> Result<u64> {
        move |a: Addr| {
            mem.get(&a.u64()).copied().ok_or(LiveError::ReadFailure {
                addr: a,
                wanted: 8,
                got: 0,
            })
        }
    }

    #[test]
    fn test_walk_two_frames() {
        let mem = HashMap::from([
            (0x7000, 0x7100), // saved fp of inner
            (0x7008, 0x2050), // return into main
            (0x7100, 0),      // outermost
            (0x7108, 0x9999),
        ]);
        let frames = walk_frames(
            Addr::new(0x1010),
            Addr::new(0x7000),
            8,
            &symbols(),
            64,
            reader(mem),
        );
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].name.as_deref(), Some("inner"));
        assert_eq!(frames[1].addr, Addr::new(0x2050));
        assert_eq!(frames[1].name.as_deref(), Some("main"));
        assert_eq!(frames[2].name, None);
        assert_eq!(frames[2].index, 2);
    }

    #[test]
    fn test_walk_stops_on_loop_and_cap() {
        let mem = HashMap::from([(0x7000, 0x7000), (0x7008, 0x2050)]);
        let frames = walk_frames(
            Addr::new(0x1010),
            Addr::new(0x7000),
            8,
            &symbols(),
            64,
            reader(mem),
        );
        assert_eq!(frames.len(), 2);

        let frames = walk_frames(
            Addr::new(0x1010),
            Addr::new(0x7000),
            8,
            &symbols(),
            1,
            reader(HashMap::new()),
        );
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_frame_display() {
        let frame = CallFrame {
            index: 1,
            addr: Addr::new(0x2050),
            name: None,
        };
        assert_eq!(frame.to_string(), "#1   0x0000000000002050 in ??");
    }
}
