//! Visible-window computation over the ordered cell list.
//!
//! Cells have content-dependent heights and only a contiguous range fits on
//! screen. The manager answers "which range is visible" given the index that
//! must stay visible and the current heights. It is pure with respect to its
//! inputs: no kernel or I/O state.

/// Inclusive range of cell indices currently rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub top: usize,
    pub bottom: usize,
}

impl Viewport {
    pub fn contains(&self, index: usize) -> bool {
        index >= self.top && index <= self.bottom
    }
}

#[derive(Debug, Default)]
pub struct ViewportManager {
    window: Option<Viewport>,
    /// Content height of the window when it was last computed.
    window_height: usize,
    /// Available rows when the window was last computed.
    available: usize,
    /// Cell count when the window was last computed; a structural edit
    /// anywhere invalidates the window even if the rows under it kept
    /// their heights.
    cell_count: usize,
}

impl ViewportManager {
    pub fn new() -> Self {
        ViewportManager::default()
    }

    pub fn window(&self) -> Option<Viewport> {
        self.window
    }

    /// Recompute the visible window so that `required` is inside it.
    ///
    /// Rules:
    /// - scrolling up (or first layout) anchors the window top at `required`
    ///   and grows downward; the last included cell may be clipped
    /// - scrolling down anchors the window bottom at `required` and grows
    ///   upward; the first included cell may be clipped
    /// - when `required` is already visible and neither the heights under
    ///   the window nor the available rows changed, the window is returned
    ///   unchanged
    /// - when content under the window changed height, the window is
    ///   recomputed anchored at the current top, advancing the top one cell
    ///   at a time until it contains `required` again (bounded by the cell
    ///   count)
    /// - a window whose heights sum to exactly `available` includes its
    ///   boundary cell in full
    pub fn ensure_visible(
        &mut self,
        required: usize,
        heights: &[usize],
        available: usize,
    ) -> Option<Viewport> {
        let len = heights.len();
        if len == 0 {
            self.window = None;
            self.window_height = 0;
            self.available = available;
            self.cell_count = 0;
            return None;
        }
        let required = required.min(len - 1);

        if let Some(stored) = self.window {
            let clamped = Viewport {
                top: stored.top.min(len - 1),
                bottom: stored.bottom.min(len - 1),
            };
            if clamped.contains(required) {
                let height: usize = heights[clamped.top..=clamped.bottom].iter().sum();
                if clamped == stored
                    && height == self.window_height
                    && available == self.available
                    && len == self.cell_count
                {
                    return Some(stored);
                }
                // A cell under the window grew or shrank: keep the anchor,
                // nudge the top forward until the window holds `required`.
                let mut top = clamped.top;
                loop {
                    let window = grow_down(top, heights, available);
                    if window.contains(required) || top == len - 1 {
                        return self.commit(window, heights, available);
                    }
                    top += 1;
                }
            }
            if required < clamped.top {
                return self.commit(grow_down(required, heights, available), heights, available);
            }
            return self.commit(grow_up(required, heights, available), heights, available);
        }

        self.commit(grow_down(required, heights, available), heights, available)
    }

    fn commit(&mut self, window: Viewport, heights: &[usize], available: usize) -> Option<Viewport> {
        self.window_height = heights[window.top..=window.bottom].iter().sum();
        self.available = available;
        self.cell_count = heights.len();
        self.window = Some(window);
        Some(window)
    }
}

/// Window starting at `top`, accumulating heights downward. The anchor is
/// always included; the last cell is included as long as any rows remain
/// before it, so the bottom boundary may be clipped.
fn grow_down(top: usize, heights: &[usize], available: usize) -> Viewport {
    let mut bottom = top;
    let mut used = heights[top];
    for (i, &h) in heights.iter().enumerate().skip(top + 1) {
        if used >= available {
            break;
        }
        bottom = i;
        used += h;
    }
    Viewport { top, bottom }
}

/// Window ending at `bottom`, accumulating heights upward. Mirror of
/// `grow_down`: the top boundary cell may be clipped.
fn grow_up(bottom: usize, heights: &[usize], available: usize) -> Viewport {
    let mut top = bottom;
    let mut used = heights[bottom];
    while top > 0 {
        if used >= available {
            break;
        }
        top -= 1;
        used += heights[top];
    }
    Viewport { top, bottom }
}
