//! インデックスが安定したエントリ置き場
//!
//! スロット番号がそのままエントリの ID になる。削除されたエントリは
//! tombstone（`is_disposed() == true`）としてスロットに残り、
//! `collect_tombstones()` が呼ばれるまで ID は再利用されない。

use std::sync::Arc;

/// 論理削除フラグを持つエントリ
pub(crate) trait Tombstone {
    fn is_disposed(&self) -> bool;
}

#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Option<Arc<T>>>,
}

impl<T: Tombstone> Arena<T> {
    pub(crate) fn new() -> Self {
        Arena { slots: Vec::new() }
    }

    /// 空きスロットに新しいエントリを置く。`build` はスロット番号を受け取る
    pub(crate) fn insert_with(&mut self, build: impl FnOnce(u32) -> T) -> Arc<T> {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let entry = Arc::new(build(index as u32));
        self.slots[index] = Some(entry.clone());
        entry
    }

    /// 指定のスロットにエントリを置く（既存のエントリは置き換える）
    pub(crate) fn place(&mut self, id: u32, entry: Arc<T>) -> Option<Arc<T>> {
        let index = id as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index].replace(entry)
    }

    /// 生きているエントリ
    pub(crate) fn get(&self, id: u32) -> Option<&Arc<T>> {
        self.slots
            .get(id as usize)
            .and_then(Option::as_ref)
            .filter(|entry| !entry.is_disposed())
    }

    /// 生きているエントリの一覧
    pub(crate) fn live(&self) -> impl Iterator<Item = &Arc<T>> {
        self.slots
            .iter()
            .flatten()
            .filter(|entry| !entry.is_disposed())
    }

    /// tombstone のスロットを空け、回収した数を返す
    pub(crate) fn collect_tombstones(&mut self) -> usize {
        let mut collected = 0;
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|entry| entry.is_disposed()) {
                *slot = None;
                collected += 1;
            }
        }
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        collected
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}
