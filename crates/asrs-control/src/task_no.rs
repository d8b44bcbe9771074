//! 任务号分配
//!
//! 每条命令取一个新的 8 位任务号（随机起点，从不为 0）；复合动作内部的
//! 各步使用 `base + k`，同样跳过 0。

use parking_lot::Mutex;
use rand::Rng;

/// `base + k`，在 `1..=255` 内回绕
pub fn offset(base: u8, k: u8) -> u8 {
    let n = (u16::from(base) - 1 + u16::from(k)) % 255;
    (n + 1) as u8
}

/// 任务号分配器
#[derive(Debug)]
pub struct TaskNumbers {
    next: Mutex<u8>,
}

impl Default for TaskNumbers {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskNumbers {
    pub fn new() -> Self {
        Self::starting_at(rand::thread_rng().gen_range(1..=255))
    }

    pub fn starting_at(first: u8) -> Self {
        Self {
            next: Mutex::new(first.max(1)),
        }
    }

    /// 取一个任务号，并为复合动作预留 `span` 个连续号
    pub fn draw(&self, span: u8) -> u8 {
        let mut next = self.next.lock();
        let n = *next;
        *next = offset(n, span.max(1));
        n
    }
}

/// 复合动作内部的任务号序列
#[derive(Debug, Clone, Copy)]
pub struct TaskSeq {
    base: u8,
    used: u8,
}

impl TaskSeq {
    pub fn new(base: u8) -> Self {
        Self {
            base: base.max(1),
            used: 0,
        }
    }

    pub fn base(&self) -> u8 {
        self.base
    }

    pub fn next(&mut self) -> u8 {
        let n = offset(self.base, self.used);
        self.used = self.used.wrapping_add(1);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_skips_zero() {
        assert_eq!(offset(1, 0), 1);
        assert_eq!(offset(10, 4), 14);
        assert_eq!(offset(254, 1), 255);
        assert_eq!(offset(255, 1), 1);
        assert_eq!(offset(253, 5), 3);
    }

    #[test]
    fn test_draw_never_zero() {
        let numbers = TaskNumbers::starting_at(250);
        for _ in 0..600 {
            assert_ne!(numbers.draw(6), 0);
        }
        let numbers = TaskNumbers::new();
        for _ in 0..300 {
            assert_ne!(numbers.draw(1), 0);
        }
    }

    #[test]
    fn test_seq() {
        let mut seq = TaskSeq::new(254);
        let got: Vec<u8> = (0..4).map(|_| seq.next()).collect();
        assert_eq!(got, vec![254, 255, 1, 2]);
        assert_eq!(seq.base(), 254);
    }
}
