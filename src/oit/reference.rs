//! CPU mirrors of the OIT fill and resolve shaders, one pixel at a time.

use crate::constants::{
    FAR_DEPTH_BITS, MIN_FRAGMENT_ALPHA, NULL_NODE, PPLL_KBUFFER_SIZE, PPLL_MAX_LIST_WALK, SHORTCUT_K,
};
use crate::hair::gpu_types::PpllNode;
use glam::Vec4;

const EMPTY_DEPTH: f32 = 3.0e38;

/// `pack4x8unorm`
pub fn pack_unorm4x8(v: Vec4) -> u32 {
    v.to_array()
        .iter()
        .enumerate()
        .map(|(i, c)| ((c.clamp(0.0, 1.0) * 255.0).round() as u32) << (8 * i))
        .sum()
}

/// `unpack4x8unorm`
pub fn unpack_unorm4x8(bits: u32) -> Vec4 {
    let c = |i: u32| ((bits >> (8 * i)) & 0xFF) as f32 / 255.0;
    Vec4::new(c(0), c(1), c(2), c(3))
}

/// Straight-alpha `src` over premultiplied `dst`.
pub fn over(src: Vec4, dst: Vec4) -> Vec4 {
    (src.truncate() * src.w).extend(src.w) + dst * (1.0 - src.w)
}

/// Premultiplied `src` blended onto `dst` the way the resolve pipelines do.
pub fn composite(src: Vec4, dst: Vec4) -> Vec4 {
    src + dst * (1.0 - src.w)
}

/// Head pointers, node pool and counter of the linked-list method.
#[derive(Debug, Clone)]
pub struct PpllReference {
    pub width: u32,
    pub height: u32,
    pub capacity: u32,
    pub heads: Vec<u32>,
    pub nodes: Vec<PpllNode>,
    pub counter: u32,
}

impl PpllReference {
    pub fn new(width: u32, height: u32, capacity: u32) -> Self {
        Self {
            width,
            height,
            capacity,
            heads: vec![NULL_NODE; (width * height) as usize],
            nodes: vec![PpllNode::default(); capacity as usize],
            counter: 0,
        }
    }

    pub fn clear(&mut self) {
        self.heads.fill(NULL_NODE);
        self.counter = 0;
    }

    /// Appends one fragment. Returns `false` when it was discarded.
    pub fn fill(&mut self, x: u32, y: u32, depth: f32, color: Vec4) -> bool {
        if x >= self.width || y >= self.height || color.w < MIN_FRAGMENT_ALPHA {
            return false;
        }
        let node = self.counter;
        self.counter = self.counter.wrapping_add(1);
        if node >= self.capacity {
            return false;
        }
        let pixel = (y * self.width + x) as usize;
        let previous = std::mem::replace(&mut self.heads[pixel], node);
        self.nodes[node as usize] = PpllNode {
            depth,
            color: pack_unorm4x8(color),
            next: previous,
            _pad: 0,
        };
        true
    }

    /// Nearest `PPLL_KBUFFER_SIZE` fragments sorted, the rest blended behind
    /// them in list order. `None` where the pixel has no fragments.
    pub fn resolve_pixel(&self, x: u32, y: u32) -> Option<Vec4> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let mut node = self.heads[(y * self.width + x) as usize];
        if node == NULL_NODE {
            return None;
        }

        const K: usize = PPLL_KBUFFER_SIZE as usize;
        let mut k_depth = [EMPTY_DEPTH; K];
        let mut k_color = [0u32; K];
        let mut accum = Vec4::ZERO;
        let mut filled = 0;
        let mut steps = 0;
        while node != NULL_NODE && node < self.capacity && steps < PPLL_MAX_LIST_WALK {
            let fragment = self.nodes[node as usize];
            if filled < K {
                k_depth[filled] = fragment.depth;
                k_color[filled] = fragment.color;
                filled += 1;
            } else {
                let farthest = (1..K).fold(0, |f, i| if k_depth[i] > k_depth[f] { i } else { f });
                let mut tail = fragment.color;
                if fragment.depth < k_depth[farthest] {
                    tail = k_color[farthest];
                    k_depth[farthest] = fragment.depth;
                    k_color[farthest] = fragment.color;
                }
                accum = over(unpack_unorm4x8(tail), accum);
            }
            node = fragment.next;
            steps += 1;
        }

        for _ in 0..filled {
            let mut farthest = 0;
            let mut farthest_depth = -1.0;
            for i in 0..filled {
                if k_depth[i] != EMPTY_DEPTH && k_depth[i] > farthest_depth {
                    farthest = i;
                    farthest_depth = k_depth[i];
                }
            }
            accum = over(unpack_unorm4x8(k_color[farthest]), accum);
            k_depth[farthest] = EMPTY_DEPTH;
        }
        Some(accum.clamp(Vec4::ZERO, Vec4::ONE))
    }
}

/// Depth slots, inverse-alpha and color accumulation targets of the
/// fixed-slot method.
#[derive(Debug, Clone)]
pub struct ShortCutReference {
    pub width: u32,
    pub height: u32,
    pub depth_slots: Vec<u32>,
    pub inverse_alpha: Vec<f32>,
    pub color_accum: Vec<Vec4>,
    pub evicted: u32,
}

impl ShortCutReference {
    pub fn new(width: u32, height: u32) -> Self {
        let pixels = (width * height) as usize;
        Self {
            width,
            height,
            depth_slots: vec![FAR_DEPTH_BITS; pixels * SHORTCUT_K as usize],
            inverse_alpha: vec![1.0; pixels],
            color_accum: vec![Vec4::ZERO; pixels],
            evicted: 0,
        }
    }

    fn pixel(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height).then(|| (y * self.width + x) as usize)
    }

    /// First geometry pass: keep the nearest depths, multiply coverage.
    pub fn depth_alpha(&mut self, x: u32, y: u32, depth: f32, alpha: f32) {
        let Some(pixel) = self.pixel(x, y) else {
            return;
        };
        if alpha < MIN_FRAGMENT_ALPHA {
            return;
        }
        let base = pixel * SHORTCUT_K as usize;
        let mut bits = depth.to_bits();
        for slot in &mut self.depth_slots[base..base + SHORTCUT_K as usize] {
            let old = *slot;
            *slot = old.min(bits);
            if old == FAR_DEPTH_BITS {
                bits = FAR_DEPTH_BITS;
                break;
            }
            bits = bits.max(old);
        }
        if bits != FAR_DEPTH_BITS {
            self.evicted += 1;
        }
        self.inverse_alpha[pixel] *= 1.0 - alpha;
    }

    /// The depth written into the scene depth buffer, if `K` fragments landed.
    pub fn kth_depth(&self, x: u32, y: u32) -> Option<f32> {
        let pixel = self.pixel(x, y)?;
        let bits = self.depth_slots[pixel * SHORTCUT_K as usize + SHORTCUT_K as usize - 1];
        (bits != FAR_DEPTH_BITS).then(|| f32::from_bits(bits))
    }

    /// Second geometry pass: accumulate premultiplied color of the fragments
    /// within the K nearest.
    pub fn color(&mut self, x: u32, y: u32, depth: f32, color: Vec4) {
        let Some(pixel) = self.pixel(x, y) else {
            return;
        };
        if color.w < MIN_FRAGMENT_ALPHA {
            return;
        }
        if self.kth_depth(x, y).is_some_and(|kth| depth > kth) {
            return;
        }
        self.color_accum[pixel] += (color.truncate() * color.w).extend(color.w);
    }

    /// Premultiplied hair color, `None` where the hair is transparent.
    pub fn resolve_pixel(&self, x: u32, y: u32) -> Option<Vec4> {
        let pixel = self.pixel(x, y)?;
        let transmittance = self.inverse_alpha[pixel].clamp(0.0, 1.0);
        if transmittance >= 0.999 {
            return None;
        }
        let accum = self.color_accum[pixel];
        let average = (accum.truncate() / accum.w.max(1e-4)).clamp(glam::Vec3::ZERO, glam::Vec3::ONE);
        let coverage = 1.0 - transmittance;
        Some((average * coverage).extend(coverage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec4, b: Vec4) -> bool {
        (a - b).abs().max_element() < 2.0 / 255.0
    }

    #[test]
    fn unorm_packing_matches_wgsl_layout() {
        let bits = pack_unorm4x8(Vec4::new(1.0, 0.0, 0.5, 2.0));
        assert_eq!(bits & 0xFF, 255);
        assert_eq!((bits >> 16) & 0xFF, 128);
        assert_eq!(bits >> 24, 255);
        assert!(close(unpack_unorm4x8(bits), Vec4::new(1.0, 0.0, 0.5, 1.0)));
    }

    #[test]
    fn ppll_resolve_is_independent_of_insertion_order() {
        let red = Vec4::new(1.0, 0.0, 0.0, 0.5);
        let blue = Vec4::new(0.0, 0.0, 1.0, 0.5);
        let mut a = PpllReference::new(1, 1, 8);
        a.fill(0, 0, 0.2, red);
        a.fill(0, 0, 0.6, blue);
        let mut b = PpllReference::new(1, 1, 8);
        b.fill(0, 0, 0.6, blue);
        b.fill(0, 0, 0.2, red);

        let expected = over(red, over(blue, Vec4::ZERO));
        assert!(close(a.resolve_pixel(0, 0).unwrap(), expected));
        assert!(close(b.resolve_pixel(0, 0).unwrap(), expected));
        assert!(a.resolve_pixel(0, 0).is_some());
    }

    #[test]
    fn ppll_overflow_drops_fragments_but_keeps_counting() {
        let mut ppll = PpllReference::new(2, 1, 16);
        for i in 0..100 {
            ppll.fill(0, 0, 0.01 * i as f32, Vec4::new(0.3, 0.6, 0.9, 0.4));
        }
        assert_eq!(ppll.counter, 100);
        let color = ppll.resolve_pixel(0, 0).unwrap();
        assert!(color.is_finite());
        assert!(color.cmpge(Vec4::ZERO).all() && color.cmple(Vec4::ONE).all());
        assert_eq!(ppll.resolve_pixel(1, 0), None);
    }

    #[test]
    fn ppll_walk_stops_at_corrupt_links() {
        let mut ppll = PpllReference::new(1, 1, 4);
        ppll.fill(0, 0, 0.5, Vec4::ONE);
        ppll.fill(0, 0, 0.4, Vec4::ONE);
        // A cycle and an out-of-pool link.
        ppll.nodes[0].next = 1;
        ppll.nodes[1].next = 0;
        assert!(ppll.resolve_pixel(0, 0).unwrap().is_finite());
        ppll.nodes[0].next = 1_000;
        assert!(ppll.resolve_pixel(0, 0).unwrap().is_finite());
    }

    #[test]
    fn shortcut_keeps_the_nearest_k_depths() {
        let mut sc = ShortCutReference::new(1, 1);
        let depths = [0.9, 0.1, 0.5, 0.3, 0.7, 0.2];
        for d in depths {
            sc.depth_alpha(0, 0, d, 0.5);
        }
        let slots: Vec<f32> = sc.depth_slots.iter().map(|b| f32::from_bits(*b)).collect();
        assert_eq!(slots, vec![0.1, 0.2, 0.3]);
        assert_eq!(sc.evicted, depths.len() as u32 - SHORTCUT_K);
        assert_eq!(sc.kth_depth(0, 0), Some(0.3));
        assert!((sc.inverse_alpha[0] - 0.5f32.powi(6)).abs() < 1e-6);
    }

    #[test]
    fn shortcut_resolve_is_bounded_under_heavy_overdraw() {
        let mut sc = ShortCutReference::new(1, 1);
        let fragments: Vec<(f32, Vec4)> = (0..50)
            .map(|i| (0.02 * i as f32, Vec4::new(1.0, 0.5 * (i % 2) as f32, 0.2, 0.8)))
            .collect();
        for (d, c) in &fragments {
            sc.depth_alpha(0, 0, *d, c.w);
        }
        for (d, c) in &fragments {
            sc.color(0, 0, *d, *c);
        }
        let color = sc.resolve_pixel(0, 0).unwrap();
        assert!(color.is_finite());
        assert!(color.cmpge(Vec4::ZERO).all() && color.cmple(Vec4::ONE).all());
        // Only the K nearest contributed color.
        assert!((sc.color_accum[0].w - 0.8 * SHORTCUT_K as f32).abs() < 1e-5);
    }

    #[test]
    fn a_single_fragment_resolves_the_same_in_both_methods() {
        let c = Vec4::new(0.8, 0.4, 0.2, 0.6);
        let mut ppll = PpllReference::new(1, 1, 4);
        ppll.fill(0, 0, 0.5, c);
        let mut sc = ShortCutReference::new(1, 1);
        sc.depth_alpha(0, 0, 0.5, c.w);
        sc.color(0, 0, 0.5, c);

        let scene = Vec4::new(0.0, 0.0, 0.0, 1.0);
        let a = composite(ppll.resolve_pixel(0, 0).unwrap(), scene);
        let b = composite(sc.resolve_pixel(0, 0).unwrap(), scene);
        assert!(close(a, b), "{:?} vs {:?}", a, b);
    }
}
