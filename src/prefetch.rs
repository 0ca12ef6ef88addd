//! 受信の先読みクレジット
//!
//! 断片を 1 つ渡すたびにクレジットを 1 つ使い、残っていれば 1 回だけ読み込みを要求する。
//! 読み込みは下流の要求 (demand) が残っている間だけ行う。

/// 先読みウィンドウのデフォルト
pub const DEFAULT_PREFETCH: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchBudget {
    window: u32,
    credit: u32,
    /// `u64::MAX` は無制限
    demand: u64,
}

impl Default for PrefetchBudget {
    fn default() -> Self {
        Self::new(DEFAULT_PREFETCH)
    }
}

impl PrefetchBudget {
    pub fn new(window: u32) -> Self {
        Self {
            window,
            credit: window,
            demand: u64::MAX,
        }
    }

    /// 要求を明示するまで読み込まないクレジットを作る
    pub fn bounded(window: u32) -> Self {
        Self {
            demand: 0,
            ..Self::new(window)
        }
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn credit(&self) -> u32 {
        self.credit
    }

    pub fn demand(&self) -> u64 {
        self.demand
    }

    /// もう 1 回読み込むべきか
    ///
    /// true を返したときはクレジットを 1 つ消費している
    pub fn prefetch_more(&mut self) -> bool {
        if self.credit == 0 || self.demand == 0 {
            return false;
        }
        self.credit -= 1;
        true
    }

    /// 下流から `n` 個の要求を受けてクレジットを戻す
    pub fn request(&mut self, n: u64) {
        self.demand = self.demand.saturating_add(n);
        self.credit = self.window;
    }

    /// 断片を 1 つ下流に渡した
    pub fn on_delivered(&mut self) {
        if self.demand != u64::MAX {
            self.demand = self.demand.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_limits_reads() {
        let mut budget = PrefetchBudget::new(3);
        let reads = (0..10).filter(|_| budget.prefetch_more()).count();
        assert_eq!(reads, 3);
        assert_eq!(budget.credit(), 0);
    }

    #[test]
    fn test_request_refills_credit() {
        let mut budget = PrefetchBudget::new(2);
        while budget.prefetch_more() {}
        budget.request(1);
        assert_eq!(budget.credit(), 2);
        assert!(budget.prefetch_more());
    }

    #[test]
    fn test_demand_gates_reads() {
        let mut budget = PrefetchBudget::bounded(16);
        assert!(!budget.prefetch_more());
        budget.request(1);
        assert!(budget.prefetch_more());
        budget.on_delivered();
        assert_eq!(budget.demand(), 0);
        assert!(!budget.prefetch_more());
    }

    #[test]
    fn test_unbounded_demand_is_not_consumed() {
        let mut budget = PrefetchBudget::default();
        budget.on_delivered();
        assert_eq!(budget.demand(), u64::MAX);
    }
}
