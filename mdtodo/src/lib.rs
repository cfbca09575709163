//! Markdown todo documents as an editable tree.
//! Parsing builds an arena of typed nodes over an append-only source buffer, edits go through
//! `edit`, the flat todo view is re-extracted after every change, and `format` writes the tree
//! back out while leaving untouched text byte-identical.

pub mod core {
    use chrono::NaiveDate;
    use serde::Serialize;

    /* --------------------------- Source buffer --------------------------- */

    /// Half-open byte range `[start, stop)` into a [`SourceBuffer`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct Segment {
        pub start: usize,
        pub stop: usize,
    }

    impl Segment {
        pub fn new(start: usize, stop: usize) -> Self {
            Self { start, stop }
        }

        pub fn len(&self) -> usize {
            self.stop - self.start
        }

        pub fn is_empty(&self) -> bool {
            self.start == self.stop
        }
    }

    /// Append-only text store backing every [`Segment`] of a document.
    ///
    /// Bytes are never rewritten or truncated, so a segment handed out once stays valid for the
    /// life of the buffer. Edits that replace text append the new bytes and relink nodes.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct SourceBuffer {
        text: String,
    }

    impl SourceBuffer {
        pub fn new(text: impl Into<String>) -> Self {
            Self { text: text.into() }
        }

        pub fn len(&self) -> usize {
            self.text.len()
        }

        pub fn is_empty(&self) -> bool {
            self.text.is_empty()
        }

        /// Appends `s` and returns the segment now holding it.
        pub fn append(&mut self, s: &str) -> Segment {
            let start = self.text.len();
            self.text.push_str(s);
            Segment::new(start, self.text.len())
        }

        /// Text under `seg`; empty if the range is not a valid slice of the buffer.
        pub fn slice(&self, seg: Segment) -> &str {
            self.text.get(seg.start..seg.stop).unwrap_or("")
        }

        pub fn as_str(&self) -> &str {
            &self.text
        }
    }

    /* ------------------------------ Node kinds ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ListMarker {
        /// `-`, `*` or `+`.
        Bullet(char),
        /// `1.` / `1)` style; items are renumbered from `start` when written.
        Ordered { start: u32, delimiter: char },
    }

    impl ListMarker {
        /// Marker text for the `n`th item (0-based).
        pub fn render(&self, n: usize) -> String {
            match *self {
                ListMarker::Bullet(c) => c.to_string(),
                ListMarker::Ordered { start, delimiter } => {
                    format!("{}{}", start as usize + n, delimiter)
                }
            }
        }

        /// Two markers continue the same list when they share bullet char or ordered delimiter.
        pub fn continues(&self, other: &ListMarker) -> bool {
            match (self, other) {
                (ListMarker::Bullet(a), ListMarker::Bullet(b)) => a == b,
                (
                    ListMarker::Ordered { delimiter: a, .. },
                    ListMarker::Ordered { delimiter: b, .. },
                ) => a == b,
                _ => false,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Fence {
        pub marker: char,
        pub len: usize,
    }

    /// Closed set of node kinds. Text-bearing kinds hold segments, never copies.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum NodeKind {
        Document,
        Heading {
            level: u8,
        },
        Paragraph,
        List {
            marker: ListMarker,
        },
        ListItem,
        Checkbox {
            checked: bool,
        },
        /// Literal text; `soft_break` marks the end of a source line inside a paragraph.
        Text {
            segment: Segment,
            soft_break: bool,
        },
        CodeSpan {
            ticks: usize,
        },
        Link {
            destination: Segment,
            title: Option<Segment>,
        },
        Image {
            destination: Segment,
            title: Option<Segment>,
        },
        Emphasis {
            level: u8,
            delimiter: char,
        },
        Strikethrough,
        Blockquote,
        ThematicBreak {
            raw: Segment,
        },
        /// Fenced when `fence` is set, indented otherwise. Lines exclude their indentation.
        CodeBlock {
            fence: Option<Fence>,
            info: Option<Segment>,
            lines: Vec<Segment>,
        },
    }

    impl NodeKind {
        pub fn is_list(&self) -> bool {
            matches!(self, NodeKind::List { .. })
        }
    }

    /* --------------------------------- Arena --------------------------------- */

    /// Stable handle into a [`Tree`]. Detached nodes keep their id; ids are never reused.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct NodeId(usize);

    impl NodeId {
        pub fn index(self) -> usize {
            self.0
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Node {
        pub kind: NodeKind,
        /// Whether a blank line preceded this block in the source. `None` for nodes built by
        /// edits, which fall back to the formatter's default spacing.
        pub blank_before: Option<bool>,
        parent: Option<NodeId>,
        first_child: Option<NodeId>,
        last_child: Option<NodeId>,
        prev_sibling: Option<NodeId>,
        next_sibling: Option<NodeId>,
    }

    impl Node {
        fn new(kind: NodeKind) -> Self {
            Self {
                kind,
                blank_before: None,
                parent: None,
                first_child: None,
                last_child: None,
                prev_sibling: None,
                next_sibling: None,
            }
        }
    }

    /// Document tree. The arena owns every node; parent and sibling links are plain ids used
    /// for navigation only.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Tree {
        nodes: Vec<Node>,
    }

    impl Default for Tree {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Tree {
        pub fn new() -> Self {
            Self {
                nodes: vec![Node::new(NodeKind::Document)],
            }
        }

        pub fn root(&self) -> NodeId {
            NodeId(0)
        }

        /// Number of nodes ever allocated, detached ones included.
        pub fn node_count(&self) -> usize {
            self.nodes.len()
        }

        pub fn kind(&self, id: NodeId) -> &NodeKind {
            &self.nodes[id.0].kind
        }

        pub fn kind_mut(&mut self, id: NodeId) -> &mut NodeKind {
            &mut self.nodes[id.0].kind
        }

        pub fn parent(&self, id: NodeId) -> Option<NodeId> {
            self.nodes[id.0].parent
        }

        pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
            self.nodes[id.0].first_child
        }

        pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
            self.nodes[id.0].last_child
        }

        pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
            self.nodes[id.0].prev_sibling
        }

        pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
            self.nodes[id.0].next_sibling
        }

        pub fn blank_before(&self, id: NodeId) -> Option<bool> {
            self.nodes[id.0].blank_before
        }

        pub fn set_blank_before(&mut self, id: NodeId, blank: Option<bool>) {
            self.nodes[id.0].blank_before = blank;
        }

        /// Allocates a detached node.
        pub fn alloc(&mut self, kind: NodeKind) -> NodeId {
            self.nodes.push(Node::new(kind));
            NodeId(self.nodes.len() - 1)
        }

        pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
            self.detach(child);
            let prev = self.nodes[parent.0].last_child;
            {
                let c = &mut self.nodes[child.0];
                c.parent = Some(parent);
                c.prev_sibling = prev;
                c.next_sibling = None;
            }
            match prev {
                Some(p) => self.nodes[p.0].next_sibling = Some(child),
                None => self.nodes[parent.0].first_child = Some(child),
            }
            self.nodes[parent.0].last_child = Some(child);
        }

        pub fn prepend_child(&mut self, parent: NodeId, child: NodeId) {
            match self.first_child(parent) {
                Some(first) if first != child => self.insert_before(first, child),
                Some(_) => {}
                None => self.append_child(parent, child),
            }
        }

        /// Inserts `child` immediately before `anchor`, under the anchor's parent.
        pub fn insert_before(&mut self, anchor: NodeId, child: NodeId) {
            debug_assert_ne!(anchor, child);
            self.detach(child);
            let Some(parent) = self.parent(anchor) else {
                debug_assert!(false, "insert_before on a detached anchor");
                return;
            };
            let prev = self.nodes[anchor.0].prev_sibling;
            {
                let c = &mut self.nodes[child.0];
                c.parent = Some(parent);
                c.prev_sibling = prev;
                c.next_sibling = Some(anchor);
            }
            self.nodes[anchor.0].prev_sibling = Some(child);
            match prev {
                Some(p) => self.nodes[p.0].next_sibling = Some(child),
                None => self.nodes[parent.0].first_child = Some(child),
            }
        }

        /// Inserts `child` immediately after `anchor`, under the anchor's parent.
        pub fn insert_after(&mut self, anchor: NodeId, child: NodeId) {
            debug_assert_ne!(anchor, child);
            self.detach(child);
            let Some(parent) = self.parent(anchor) else {
                debug_assert!(false, "insert_after on a detached anchor");
                return;
            };
            let next = self.nodes[anchor.0].next_sibling;
            {
                let c = &mut self.nodes[child.0];
                c.parent = Some(parent);
                c.prev_sibling = Some(anchor);
                c.next_sibling = next;
            }
            self.nodes[anchor.0].next_sibling = Some(child);
            match next {
                Some(n) => self.nodes[n.0].prev_sibling = Some(child),
                None => self.nodes[parent.0].last_child = Some(child),
            }
        }

        /// Unlinks `id` (with its subtree) from its parent. No-op for detached nodes.
        pub fn detach(&mut self, id: NodeId) {
            let Node {
                parent,
                prev_sibling,
                next_sibling,
                ..
            } = self.nodes[id.0];
            match prev_sibling {
                Some(p) => self.nodes[p.0].next_sibling = next_sibling,
                None => {
                    if let Some(par) = parent {
                        self.nodes[par.0].first_child = next_sibling;
                    }
                }
            }
            match next_sibling {
                Some(n) => self.nodes[n.0].prev_sibling = prev_sibling,
                None => {
                    if let Some(par) = parent {
                        self.nodes[par.0].last_child = prev_sibling;
                    }
                }
            }
            let node = &mut self.nodes[id.0];
            node.parent = None;
            node.prev_sibling = None;
            node.next_sibling = None;
        }

        pub fn children(&self, id: NodeId) -> Children<'_> {
            Children {
                tree: self,
                next: self.first_child(id),
            }
        }

        /// Pre-order walk of `id` and everything below it.
        pub fn descendants(&self, id: NodeId) -> Descendants<'_> {
            Descendants {
                tree: self,
                root: id,
                next: Some(id),
            }
        }

        pub fn is_ancestor_or_self(&self, ancestor: NodeId, mut id: NodeId) -> bool {
            loop {
                if id == ancestor {
                    return true;
                }
                match self.parent(id) {
                    Some(p) => id = p,
                    None => return false,
                }
            }
        }

        /// For a task-list item, its first paragraph and the checkbox leading it.
        pub fn task_parts(&self, item: NodeId) -> Option<(NodeId, NodeId)> {
            if !matches!(self.kind(item), NodeKind::ListItem) {
                return None;
            }
            let para = self.first_child(item)?;
            if !matches!(self.kind(para), NodeKind::Paragraph) {
                return None;
            }
            let checkbox = self.first_child(para)?;
            matches!(self.kind(checkbox), NodeKind::Checkbox { .. }).then_some((para, checkbox))
        }

        pub fn is_task_item(&self, item: NodeId) -> bool {
            self.task_parts(item).is_some()
        }
    }

    pub struct Children<'a> {
        tree: &'a Tree,
        next: Option<NodeId>,
    }

    impl Iterator for Children<'_> {
        type Item = NodeId;

        fn next(&mut self) -> Option<NodeId> {
            let cur = self.next?;
            self.next = self.tree.next_sibling(cur);
            Some(cur)
        }
    }

    pub struct Descendants<'a> {
        tree: &'a Tree,
        root: NodeId,
        next: Option<NodeId>,
    }

    impl Iterator for Descendants<'_> {
        type Item = NodeId;

        fn next(&mut self) -> Option<NodeId> {
            let cur = self.next?;
            self.next = if let Some(child) = self.tree.first_child(cur) {
                Some(child)
            } else {
                let mut n = cur;
                loop {
                    if n == self.root {
                        break None;
                    }
                    if let Some(sib) = self.tree.next_sibling(n) {
                        break Some(sib);
                    }
                    match self.tree.parent(n) {
                        Some(p) => n = p,
                        None => break None,
                    }
                }
            };
            Some(cur)
        }
    }

    /* ---------------------------- Projections ---------------------------- */

    /// One checkbox-bearing list item, as seen by callers. Rebuilt from the tree after every edit.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Todo {
        pub index: usize,
        pub checked: bool,
        /// Item text re-emitted as markdown (code spans, links and emphasis keep their syntax).
        pub text: String,
        /// Number of task sublists enclosing the item (0 = top-level list).
        pub depth: usize,
        /// Closest earlier todo one level up; `None` at depth 0.
        pub parent_index: Option<usize>,
        pub tags: Vec<String>,
        pub priority: Option<u32>,
        pub due_date: Option<NaiveDate>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Heading {
        pub level: u8,
        pub text: String,
        /// Index of the next todo in document order (equals the todo count past the last one).
        pub before_todo_index: usize,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum EditError {
        #[error("todo index {index} is out of range ({len} todos)")]
        IndexOutOfRange { index: usize, len: usize },
        #[error("todo {index} not found")]
        NotFound { index: usize },
        #[error("todo {index} has no previous sibling to indent under")]
        NoPreviousSibling { index: usize },
        #[error("todo {index} is already at the top level")]
        AlreadyTopLevel { index: usize },
        #[error("cannot place todo {from} relative to todo {to}, which lies inside it")]
        TargetInsideSource { from: usize, to: usize },
    }

    impl EditError {
        /// Structural preconditions, as opposed to bad indices.
        pub fn is_structural(&self) -> bool {
            matches!(
                self,
                EditError::NoPreviousSibling { .. }
                    | EditError::AlreadyTopLevel { .. }
                    | EditError::TargetInsideSource { .. }
            )
        }
    }

}

pub mod parser {
    //! Markdown parser.
    //!
    //! Strategy mirrors a line-oriented scanner:
    //! - Blocks are recognised line by line; list items and blockquotes strip their prefix and
    //!   recurse over the remaining lines, so every line keeps its absolute byte offset.
    //! - Inline content is parsed per line with `nom` combinators. Anything that does not parse
    //!   falls back to literal text one char at a time, so parsing never fails.

    use std::cell::RefCell;
    use std::collections::HashMap;

    use crate::core::*;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till, take_till1, take_while, take_while1},
        character::complete::{anychar, char, satisfy},
        error::{VerboseError, VerboseErrorKind},
        sequence::preceded,
    };

    /* ------------------------ Public entry points ------------------------ */

    /// Parse markdown text into a source buffer and the tree that references it.
    pub fn parse_markdown(input: &str) -> (SourceBuffer, Tree) {
        let source = SourceBuffer::new(input);
        let mut tree = Tree::new();
        let root = tree.root();
        let lines = split_lines(input, 0);
        BlockParser { tree: &mut tree }.blocks(&lines, root);
        tracing::debug!(
            nodes = tree.node_count(),
            bytes = input.len(),
            "parsed markdown"
        );
        (source, tree)
    }

    /// Parse one line of `text` (already appended to the buffer at `base`) as inline content
    /// and append the resulting nodes under `parent`.
    pub(crate) fn attach_fragment(tree: &mut Tree, parent: NodeId, text: &str, base: usize) {
        attach_spans(tree, parent, parse_spans(text, base));
    }

    /* ------------------------------- Lines ------------------------------- */

    #[derive(Debug, Clone, Copy)]
    pub(crate) struct Line<'a> {
        text: &'a str,
        offset: usize,
    }

    impl<'a> Line<'a> {
        fn indent(&self) -> usize {
            self.text.bytes().take_while(|b| *b == b' ').count()
        }

        fn is_blank(&self) -> bool {
            self.text.trim().is_empty()
        }

        fn skip(&self, n: usize) -> Line<'a> {
            let n = n.min(self.text.len());
            match self.text.get(n..) {
                Some(text) => Line {
                    text,
                    offset: self.offset + n,
                },
                None => *self,
            }
        }

        fn strip_indent(&self, max: usize) -> Line<'a> {
            self.skip(self.indent().min(max))
        }

        fn trim_start(&self) -> Line<'a> {
            self.skip(self.text.len() - self.text.trim_start().len())
        }

        fn trim_end(&self) -> Line<'a> {
            Line {
                text: self.text.trim_end(),
                offset: self.offset,
            }
        }

        fn end(&self) -> usize {
            self.offset + self.text.len()
        }

        fn segment(&self) -> Segment {
            Segment::new(self.offset, self.end())
        }
    }

    pub(crate) fn split_lines(text: &str, base: usize) -> Vec<Line<'_>> {
        let mut lines = Vec::new();
        let mut offset = base;
        for raw in text.split_inclusive('\n') {
            let body = raw.strip_suffix('\n').unwrap_or(raw);
            let body = body.strip_suffix('\r').unwrap_or(body);
            lines.push(Line { text: body, offset });
            offset += raw.len();
        }
        lines
    }

    /* --------------------------- Block starts --------------------------- */

    fn heading_start(t: &str) -> Option<(u8, usize)> {
        let hashes = t.bytes().take_while(|b| *b == b'#').count();
        if !(1..=6).contains(&hashes) {
            return None;
        }
        let rest = &t[hashes..];
        if rest.is_empty() {
            return Some((hashes as u8, hashes));
        }
        if !rest.starts_with([' ', '\t']) {
            return None;
        }
        let pad = rest.len() - rest.trim_start().len();
        Some((hashes as u8, hashes + pad))
    }

    fn fence_start(t: &str) -> Option<Fence> {
        let marker = t.chars().next().filter(|c| *c == '`' || *c == '~')?;
        let len = t.chars().take_while(|c| *c == marker).count();
        if len < 3 {
            return None;
        }
        if marker == '`' && t[len..].contains('`') {
            return None;
        }
        Some(Fence { marker, len })
    }

    fn closes_fence(line: &Line<'_>, fence: Fence) -> bool {
        let ind = line.indent();
        if ind > 3 {
            return false;
        }
        let t = &line.text[ind..];
        let run = t.chars().take_while(|c| *c == fence.marker).count();
        run >= fence.len && t[run..].trim().is_empty()
    }

    fn is_thematic_break(t: &str) -> bool {
        let Some(marker) = t.chars().next().filter(|c| matches!(c, '-' | '*' | '_')) else {
            return false;
        };
        let mut count = 0;
        for c in t.chars() {
            if c == marker {
                count += 1;
            } else if c != ' ' && c != '\t' {
                return false;
            }
        }
        count >= 3
    }

    /// List marker at the start of `line`, with the column where item content begins.
    fn list_marker(line: &Line<'_>) -> Option<(ListMarker, usize, bool)> {
        let ind = line.indent();
        if ind > 3 {
            return None;
        }
        let t = &line.text[ind..];
        let (marker, width) = match t.chars().next()? {
            c @ ('-' | '*' | '+') => (ListMarker::Bullet(c), 1),
            _ => {
                let digits = t.bytes().take_while(u8::is_ascii_digit).count();
                if digits == 0 || digits > 9 {
                    return None;
                }
                let delimiter = t[digits..].chars().next().filter(|c| *c == '.' || *c == ')')?;
                let start = t[..digits].parse().ok()?;
                (ListMarker::Ordered { start, delimiter }, digits + 1)
            }
        };
        let after = &t[width..];
        let spaces = after.bytes().take_while(|b| *b == b' ').count();
        if after.is_empty() || spaces == after.len() {
            return Some((marker, ind + width + 1, true));
        }
        if spaces == 0 {
            return None;
        }
        let spaces = if spaces > 4 { 1 } else { spaces };
        Some((marker, ind + width + spaces, false))
    }

    /// Whether `line` starts a block that ends a running paragraph.
    fn interrupts_paragraph(line: &Line<'_>) -> bool {
        let ind = line.indent();
        if ind > 3 {
            return false;
        }
        let t = &line.text[ind..];
        if heading_start(t).is_some()
            || fence_start(t).is_some()
            || is_thematic_break(t)
            || t.starts_with('>')
        {
            return true;
        }
        match list_marker(line) {
            Some((ListMarker::Bullet(_), _, empty)) => !empty,
            Some((ListMarker::Ordered { start, .. }, _, empty)) => start == 1 && !empty,
            None => false,
        }
    }

    fn paragraph_end(lines: &[Line<'_>], start: usize) -> usize {
        let mut j = start + 1;
        while j < lines.len() && !lines[j].is_blank() && !interrupts_paragraph(&lines[j]) {
            j += 1;
        }
        j
    }

    fn next_non_blank(lines: &[Line<'_>], from: usize) -> usize {
        let mut k = from;
        while k < lines.len() && lines[k].is_blank() {
            k += 1;
        }
        k
    }

    /// `[ ] `, `[x] ` or `[X] ` leading an item's first line.
    fn task_marker<'a>(line: &Line<'a>) -> Option<(bool, Line<'a>)> {
        let t = line.text;
        let checked = match t.get(..3)? {
            "[ ]" => false,
            "[x]" | "[X]" => true,
            _ => return None,
        };
        t[3..]
            .starts_with([' ', '\t'])
            .then(|| (checked, line.skip(4)))
    }

    /* ---------------------------- Block parser ---------------------------- */

    struct BlockParser<'t> {
        tree: &'t mut Tree,
    }

    impl BlockParser<'_> {
        fn blocks(&mut self, lines: &[Line<'_>], parent: NodeId) {
            let mut i = 0;
            let mut blank = false;
            while i < lines.len() {
                let line = lines[i];
                if line.is_blank() {
                    blank = true;
                    i += 1;
                    continue;
                }
                let ind = line.indent();
                let t = line.skip(ind);
                let (node, next) = if ind >= 4 {
                    self.indented_code(lines, i, parent)
                } else if let Some(fence) = fence_start(t.text) {
                    self.fenced_code(lines, i, fence, parent)
                } else if let Some((level, content)) = heading_start(t.text) {
                    let heading = self.push(parent, NodeKind::Heading { level });
                    let content = t.skip(content).trim_end();
                    attach_inline_lines(self.tree, heading, &[content]);
                    (heading, i + 1)
                } else if is_thematic_break(t.text) {
                    let raw = t.trim_end().segment();
                    (self.push(parent, NodeKind::ThematicBreak { raw }), i + 1)
                } else if t.text.starts_with('>') {
                    self.blockquote(lines, i, parent)
                } else if let Some((marker, _, _)) = list_marker(&line) {
                    self.list(lines, i, marker, parent)
                } else {
                    let end = paragraph_end(lines, i);
                    let body: Vec<Line<'_>> =
                        lines[i..end].iter().map(Line::trim_start).collect();
                    (self.paragraph(&body, parent, None), end)
                };
                self.tree.set_blank_before(node, Some(blank));
                blank = false;
                i = next;
            }
        }

        fn push(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
            let id = self.tree.alloc(kind);
            self.tree.append_child(parent, id);
            id
        }

        fn paragraph(
            &mut self,
            lines: &[Line<'_>],
            parent: NodeId,
            checkbox: Option<bool>,
        ) -> NodeId {
            let para = self.push(parent, NodeKind::Paragraph);
            if let Some(checked) = checkbox {
                self.push(para, NodeKind::Checkbox { checked });
            }
            attach_inline_lines(self.tree, para, lines);
            para
        }

        fn indented_code(
            &mut self,
            lines: &[Line<'_>],
            start: usize,
            parent: NodeId,
        ) -> (NodeId, usize) {
            let mut end = start;
            let mut j = start;
            while j < lines.len() {
                if lines[j].is_blank() {
                    j += 1;
                } else if lines[j].indent() >= 4 {
                    j += 1;
                    end = j;
                } else {
                    break;
                }
            }
            let segments = lines[start..end]
                .iter()
                .map(|l| {
                    if l.is_blank() {
                        Segment::new(l.offset, l.offset)
                    } else {
                        l.skip(4).segment()
                    }
                })
                .collect();
            let node = self.push(
                parent,
                NodeKind::CodeBlock {
                    fence: None,
                    info: None,
                    lines: segments,
                },
            );
            (node, end)
        }

        fn fenced_code(
            &mut self,
            lines: &[Line<'_>],
            start: usize,
            fence: Fence,
            parent: NodeId,
        ) -> (NodeId, usize) {
            let open = lines[start];
            let ind = open.indent();
            let info = open.skip(ind + fence.len).trim_start().trim_end();
            let info = (!info.text.is_empty()).then(|| info.segment());

            let mut end = lines.len();
            let mut next = lines.len();
            for (j, line) in lines.iter().enumerate().skip(start + 1) {
                if closes_fence(line, fence) {
                    end = j;
                    next = j + 1;
                    break;
                }
            }
            let body = lines[start + 1..end]
                .iter()
                .map(|l| l.strip_indent(ind).segment())
                .collect();
            let node = self.push(
                parent,
                NodeKind::CodeBlock {
                    fence: Some(fence),
                    info,
                    lines: body,
                },
            );
            (node, next)
        }

        fn blockquote(
            &mut self,
            lines: &[Line<'_>],
            start: usize,
            parent: NodeId,
        ) -> (NodeId, usize) {
            let mut inner: Vec<Line<'_>> = Vec::new();
            let mut j = start;
            while j < lines.len() {
                let line = lines[j];
                let ind = line.indent();
                if ind <= 3 && line.text[ind..].starts_with('>') {
                    let rest = line.skip(ind + 1);
                    inner.push(if rest.text.starts_with(' ') {
                        rest.skip(1)
                    } else {
                        rest
                    });
                } else if !line.is_blank()
                    && inner.last().is_some_and(|l| !l.is_blank())
                    && !interrupts_paragraph(&line)
                {
                    inner.push(line.trim_start());
                } else {
                    break;
                }
                j += 1;
            }
            let quote = self.push(parent, NodeKind::Blockquote);
            self.blocks(&inner, quote);
            (quote, j)
        }

        fn list(
            &mut self,
            lines: &[Line<'_>],
            start: usize,
            marker: ListMarker,
            parent: NodeId,
        ) -> (NodeId, usize) {
            let list = self.push(parent, NodeKind::List { marker });
            let mut i = start;
            let mut blank = false;
            while i < lines.len() {
                let line = lines[i];
                if line.is_blank() {
                    let k = next_non_blank(lines, i);
                    let continues = k < lines.len()
                        && list_marker(&lines[k]).is_some_and(|(m, _, _)| m.continues(&marker));
                    if !continues {
                        break;
                    }
                    blank = true;
                    i = k;
                    continue;
                }
                let Some((m, content_col, _)) = list_marker(&line) else {
                    break;
                };
                if !m.continues(&marker) {
                    break;
                }

                let mut body = vec![line.skip(content_col)];
                let mut j = i + 1;
                while j < lines.len() {
                    let l = lines[j];
                    if l.is_blank() {
                        let k = next_non_blank(lines, j);
                        if k < lines.len() && lines[k].indent() >= content_col {
                            body.extend(lines[j..k].iter().map(|b| b.strip_indent(content_col)));
                            j = k;
                            continue;
                        }
                        break;
                    }
                    if l.indent() >= content_col {
                        body.push(l.skip(content_col));
                    } else if body.last().is_some_and(|b| !b.is_blank())
                        && !interrupts_paragraph(&l)
                        && list_marker(&l).is_none()
                    {
                        // lazy continuation
                        body.push(l.trim_start());
                    } else {
                        break;
                    }
                    j += 1;
                }

                let item = self.push(list, NodeKind::ListItem);
                self.tree.set_blank_before(item, Some(blank));
                blank = false;
                self.item_content(&body, item);
                i = j;
            }
            (list, i)
        }

        fn item_content(&mut self, body: &[Line<'_>], item: NodeId) {
            let Some(first) = body.first() else {
                return;
            };
            match task_marker(first) {
                Some((checked, rest)) => {
                    let end = paragraph_end(body, 0);
                    let mut para_lines: Vec<Line<'_>> = Vec::with_capacity(end);
                    para_lines.push(rest);
                    para_lines.extend(body[1..end].iter().map(Line::trim_start));
                    let para = self.paragraph(&para_lines, item, Some(checked));
                    self.tree.set_blank_before(para, Some(false));
                    self.blocks(&body[end..], item);
                }
                None if first.is_blank() && body.len() == 1 => {}
                None => self.blocks(body, item),
            }
        }
    }

    /* --------------------------- INLINE MARKUP --------------------------- */

    fn attach_inline_lines(tree: &mut Tree, parent: NodeId, lines: &[Line<'_>]) {
        for (k, line) in lines.iter().enumerate() {
            attach_spans(tree, parent, parse_spans(line.text, line.offset));
            if k + 1 == lines.len() {
                break;
            }
            let line_end = line.end();
            let marked = match tree.last_child(parent) {
                Some(last) => match tree.kind_mut(last) {
                    NodeKind::Text {
                        segment,
                        soft_break,
                    } if segment.stop == line_end && !*soft_break => {
                        *soft_break = true;
                        true
                    }
                    _ => false,
                },
                None => false,
            };
            if !marked {
                let brk = tree.alloc(NodeKind::Text {
                    segment: Segment::new(line_end, line_end),
                    soft_break: true,
                });
                tree.append_child(parent, brk);
            }
        }
    }

    /// Inline parse result before it is moved into the arena.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Span {
        Text(Segment),
        Code {
            ticks: usize,
            body: Segment,
        },
        Link {
            image: bool,
            children: Vec<Span>,
            destination: Segment,
            title: Option<Segment>,
        },
        Emphasis {
            level: u8,
            delimiter: char,
            children: Vec<Span>,
        },
        Strike(Vec<Span>),
    }

    fn attach_spans(tree: &mut Tree, parent: NodeId, spans: Vec<Span>) {
        for span in spans {
            let (kind, children) = match span {
                Span::Text(segment) => (
                    NodeKind::Text {
                        segment,
                        soft_break: false,
                    },
                    vec![],
                ),
                Span::Code { ticks, body } => (
                    NodeKind::CodeSpan { ticks },
                    vec![Span::Text(body)],
                ),
                Span::Link {
                    image,
                    children,
                    destination,
                    title,
                } => {
                    let kind = if image {
                        NodeKind::Image { destination, title }
                    } else {
                        NodeKind::Link { destination, title }
                    };
                    (kind, children)
                }
                Span::Emphasis {
                    level,
                    delimiter,
                    children,
                } => (NodeKind::Emphasis { level, delimiter }, children),
                Span::Strike(children) => (NodeKind::Strikethrough, children),
            };
            let id = tree.alloc(kind);
            tree.append_child(parent, id);
            attach_spans(tree, id, children);
        }
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Outcome of each nested construct, keyed by line position and construct.
    type Memo = RefCell<HashMap<(usize, u8), Option<(usize, Span)>>>;

    /// Maps sub-slices of one line back to absolute buffer offsets.
    #[derive(Debug, Clone, Copy)]
    struct Cx<'a> {
        full: &'a str,
        base: usize,
        memo: &'a Memo,
    }

    impl<'a> Cx<'a> {
        /// Segment covering the text between suffixes `from` and `to` of the line.
        fn seg(&self, from: &'a str, to: &'a str) -> Segment {
            let end = self.base + self.full.len();
            Segment::new(end - from.len(), end - to.len())
        }

        /// Runs `parse` at most once per position. Unclosed openers would otherwise rescan the
        /// rest of the line once for every opener after them.
        fn once(
            self,
            i: &'a str,
            construct: u8,
            parse: impl FnOnce(&'a str) -> PResult<'a, Span>,
        ) -> PResult<'a, Span> {
            let at = self.full.len() - i.len();
            let hit = self.memo.borrow().get(&(at, construct)).cloned();
            match hit {
                Some(Some((end, span))) => return Ok((&self.full[end..], span)),
                Some(None) => return fail(i, "no-match"),
                None => {}
            }
            let result = parse(i);
            let entry = match &result {
                Ok((r, span)) => Some((self.full.len() - r.len(), span.clone())),
                Err(_) => None,
            };
            self.memo.borrow_mut().insert((at, construct), entry);
            result
        }
    }

    fn fail<'a, T>(i: &'a str, ctx: &'static str) -> PResult<'a, T> {
        Err(nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context(ctx))],
        }))
    }

    fn parse_spans(text: &str, base: usize) -> Vec<Span> {
        let memo = Memo::default();
        let cx = Cx {
            full: text,
            base,
            memo: &memo,
        };
        match inlines(cx, text) {
            Ok((_, mut v)) => {
                coalesce_text(&mut v);
                v
            }
            Err(_) if text.is_empty() => vec![],
            Err(_) => vec![Span::Text(Segment::new(base, base + text.len()))],
        }
    }

    fn inlines<'a>(cx: Cx<'a>, mut i: &'a str) -> PResult<'a, Vec<Span>> {
        let mut out = Vec::new();
        while !i.is_empty() {
            i = push_atom(cx, i, &mut out)?;
        }
        Ok((i, out))
    }

    fn inlines_until<'a>(cx: Cx<'a>, mut i: &'a str, stop: &str) -> PResult<'a, Vec<Span>> {
        if !i.contains(stop) {
            return fail(i, "unclosed-inline");
        }
        let mut out = Vec::new();
        loop {
            if i.is_empty() {
                return fail(i, "unclosed-inline");
            }
            if i.starts_with(stop) {
                break;
            }
            i = push_atom(cx, i, &mut out)?;
        }
        coalesce_text(&mut out);
        Ok((i, out))
    }

    fn push_atom<'a>(
        cx: Cx<'a>,
        i: &'a str,
        out: &mut Vec<Span>,
    ) -> Result<&'a str, nom::Err<VerboseError<&'a str>>> {
        match inline_atom(cx, i) {
            Ok((r, span)) => {
                out.push(span);
                Ok(r)
            }
            Err(_) => {
                let (r, _) = anychar(i)?;
                out.push(Span::Text(cx.seg(i, r)));
                Ok(r)
            }
        }
    }

    fn inline_atom<'a>(cx: Cx<'a>, i: &'a str) -> PResult<'a, Span> {
        alt((
            move |i: &'a str| escaped(cx, i),
            move |i: &'a str| code_span(cx, i),
            move |i: &'a str| cx.once(i, 0, |i| link(cx, i, true)),
            move |i: &'a str| cx.once(i, 1, |i| link(cx, i, false)),
            move |i: &'a str| cx.once(i, 2, |i| emphasis(cx, i, "**", 2, '*')),
            move |i: &'a str| cx.once(i, 3, |i| emphasis(cx, i, "__", 2, '_')),
            move |i: &'a str| cx.once(i, 4, |i| emphasis(cx, i, "*", 1, '*')),
            move |i: &'a str| cx.once(i, 5, |i| emphasis(cx, i, "_", 1, '_')),
            move |i: &'a str| cx.once(i, 6, |i| strikethrough(cx, i)),
            move |i: &'a str| text_chunk(cx, i),
        ))(i)
    }

    fn coalesce_text(xs: &mut Vec<Span>) {
        let mut out: Vec<Span> = Vec::with_capacity(xs.len());
        for x in xs.drain(..) {
            if let (Some(Span::Text(prev)), Span::Text(seg)) = (out.last_mut(), &x) {
                if prev.stop == seg.start {
                    prev.stop = seg.stop;
                    continue;
                }
            }
            out.push(x);
        }
        *xs = out;
    }

    fn is_special(c: char) -> bool {
        matches!(c, '\\' | '`' | '[' | '!' | '*' | '_' | '~')
    }

    fn text_chunk<'a>(cx: Cx<'a>, i: &'a str) -> PResult<'a, Span> {
        let (r, _) = take_till1(is_special)(i)?;
        Ok((r, Span::Text(cx.seg(i, r))))
    }

    fn escaped<'a>(cx: Cx<'a>, i: &'a str) -> PResult<'a, Span> {
        let (r, _) = preceded(char('\\'), satisfy(|c| c.is_ascii_punctuation()))(i)?;
        Ok((r, Span::Text(cx.seg(i, r))))
    }

    fn code_span<'a>(cx: Cx<'a>, i: &'a str) -> PResult<'a, Span> {
        let (body, ticks) = take_while1(|c: char| c == '`')(i)?;
        let n = ticks.len();
        let mut search = body;
        loop {
            let Some(pos) = search.find('`') else {
                return fail(i, "unclosed-code-span");
            };
            let run = search[pos..].bytes().take_while(|b| *b == b'`').count();
            let after = &search[pos + run..];
            if run == n {
                let close = &search[pos..];
                return Ok((
                    after,
                    Span::Code {
                        ticks: n,
                        body: cx.seg(body, close),
                    },
                ));
            }
            search = after;
        }
    }

    fn link<'a>(cx: Cx<'a>, i: &'a str, image: bool) -> PResult<'a, Span> {
        let mut r = i;
        if image {
            r = char('!')(r)?.0;
        }
        let (r, _) = char('[')(r)?;
        let (r, children) = inlines_until(cx, r, "]")?;
        let (dest_start, _) = tag("](")(r)?;
        let (dest_end, _) = take_while(|c: char| !c.is_whitespace() && c != ')')(dest_start)?;
        let destination = cx.seg(dest_start, dest_end);
        let (r, title) = match preceded(
            char::<&str, VerboseError<&str>>(' '),
            char('"'),
        )(dest_end)
        {
            Ok((title_start, _)) => {
                let (title_end, _) = take_till(|c: char| c == '"')(title_start)?;
                let (r, _) = char('"')(title_end)?;
                (r, Some(cx.seg(title_start, title_end)))
            }
            Err(_) => (dest_end, None),
        };
        let (r, _) = char(')')(r)?;
        Ok((
            r,
            Span::Link {
                image,
                children,
                destination,
                title,
            },
        ))
    }

    fn emphasis<'a>(
        cx: Cx<'a>,
        i: &'a str,
        delim: &'static str,
        level: u8,
        delimiter: char,
    ) -> PResult<'a, Span> {
        let (body, _) = tag(delim)(i)?;
        if body.is_empty() || body.starts_with(char::is_whitespace) {
            return fail(i, "emphasis-open");
        }
        let (close, children) = inlines_until(cx, body, delim)?;
        let inner = &body[..body.len() - close.len()];
        if children.is_empty() || inner.ends_with(char::is_whitespace) {
            return fail(i, "emphasis-close");
        }
        let (r, _) = tag(delim)(close)?;
        Ok((
            r,
            Span::Emphasis {
                level,
                delimiter,
                children,
            },
        ))
    }

    fn strikethrough<'a>(cx: Cx<'a>, i: &'a str) -> PResult<'a, Span> {
        let (body, _) = tag("~~")(i)?;
        if body.is_empty() || body.starts_with(char::is_whitespace) {
            return fail(i, "strike-open");
        }
        let (close, children) = inlines_until(cx, body, "~~")?;
        let inner = &body[..body.len() - close.len()];
        if children.is_empty() || inner.ends_with(char::is_whitespace) {
            return fail(i, "strike-close");
        }
        let (r, _) = tag("~~")(close)?;
        Ok((r, Span::Strike(children)))
    }

}

pub mod format {
    //! Tree → markdown. Block layout is regenerated from node kinds; literal text is copied from
    //! the source buffer, so untouched content comes back byte for byte.

    use crate::core::*;
    use crate::metadata::Metadata;

    /// Prepended when the document does not open with a heading.
    pub const DEFAULT_HEADING: &str = "# Todos\n\n";

    /// How soft line breaks inside a paragraph are written.
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum Breaks<'a> {
        /// Newline followed by the continuation indent.
        Line(&'a str),
        /// A single space (flattened text for the todo view).
        Space,
    }

    pub fn format_document(tree: &Tree, source: &SourceBuffer, metadata: &Metadata) -> String {
        let mut body = String::new();
        write_blocks(tree, source, tree.root(), "", &mut body);

        let mut out = String::new();
        match metadata.to_block() {
            Ok(Some(block)) => out.push_str(&block),
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "dropping metadata block that failed to encode"),
        }
        if !opens_with_heading(tree) {
            out.push_str(DEFAULT_HEADING);
        }
        let body = body.trim_end_matches('\n');
        if !body.is_empty() {
            out.push_str(body);
            out.push('\n');
        }
        out
    }

    fn opens_with_heading(tree: &Tree) -> bool {
        tree.first_child(tree.root())
            .is_some_and(|first| matches!(tree.kind(first), NodeKind::Heading { .. }))
    }

    /// Spacing between two sibling blocks when the source did not record one.
    fn default_gap(prev: &NodeKind, next: &NodeKind) -> bool {
        !matches!((prev, next), (NodeKind::Paragraph, NodeKind::List { .. }))
    }

    fn write_blocks(tree: &Tree, source: &SourceBuffer, parent: NodeId, indent: &str, out: &mut String) {
        let mut prev: Option<NodeId> = None;
        for child in tree.children(parent) {
            if let Some(p) = prev {
                let gap = tree
                    .blank_before(child)
                    .unwrap_or_else(|| default_gap(tree.kind(p), tree.kind(child)));
                if gap {
                    out.push('\n');
                }
            }
            write_block(tree, source, child, indent, out);
            prev = Some(child);
        }
    }

    fn write_block(tree: &Tree, source: &SourceBuffer, id: NodeId, indent: &str, out: &mut String) {
        match tree.kind(id) {
            NodeKind::Document => write_blocks(tree, source, id, indent, out),
            NodeKind::Heading { level } => {
                out.push_str(indent);
                out.push_str(&"#".repeat(*level as usize));
                let mut text = String::new();
                write_inlines(tree, source, id, Breaks::Space, &mut text);
                if !text.is_empty() {
                    out.push(' ');
                    out.push_str(&text);
                }
                out.push('\n');
            }
            NodeKind::Paragraph => {
                out.push_str(indent);
                write_inlines(tree, source, id, Breaks::Line(indent), out);
                out.push('\n');
            }
            NodeKind::List { marker } => {
                for (n, item) in tree.children(id).enumerate() {
                    if n > 0 && tree.blank_before(item) == Some(true) {
                        out.push('\n');
                    }
                    write_item(tree, source, item, &marker.render(n), indent, out);
                }
            }
            NodeKind::ListItem => write_item(tree, source, id, "-", indent, out),
            NodeKind::Blockquote => {
                let mut inner = String::new();
                write_blocks(tree, source, id, "", &mut inner);
                for line in inner.lines() {
                    out.push_str(indent);
                    if line.is_empty() {
                        out.push('>');
                    } else {
                        out.push_str("> ");
                        out.push_str(line);
                    }
                    out.push('\n');
                }
            }
            NodeKind::ThematicBreak { raw } => {
                out.push_str(indent);
                out.push_str(source.slice(*raw));
                out.push('\n');
            }
            NodeKind::CodeBlock { fence, info, lines } => {
                let (open, close) = match fence {
                    Some(f) => {
                        let run = f.marker.to_string().repeat(f.len);
                        let info = info.map(|seg| source.slice(seg)).unwrap_or("");
                        (Some(format!("{run}{info}")), Some(run))
                    }
                    None => (None, None),
                };
                let pad = if fence.is_some() { "" } else { "    " };
                if let Some(open) = open {
                    out.push_str(indent);
                    out.push_str(&open);
                    out.push('\n');
                }
                for seg in lines {
                    let text = source.slice(*seg);
                    if !text.is_empty() {
                        out.push_str(indent);
                        out.push_str(pad);
                        out.push_str(text);
                    }
                    out.push('\n');
                }
                if let Some(close) = close {
                    out.push_str(indent);
                    out.push_str(&close);
                    out.push('\n');
                }
            }
            // Inline kinds at block level: write their content as a line.
            _ => {
                out.push_str(indent);
                write_inline(tree, source, id, Breaks::Line(indent), out);
                out.push('\n');
            }
        }
    }

    /// Writes `marker` then the item's blocks, the first one on the marker line.
    fn write_item(
        tree: &Tree,
        source: &SourceBuffer,
        item: NodeId,
        marker: &str,
        indent: &str,
        out: &mut String,
    ) {
        out.push_str(indent);
        out.push_str(marker);
        if tree.first_child(item).is_none() {
            out.push('\n');
            return;
        }
        let cont = format!("{indent}{}", " ".repeat(marker.len() + 1));
        let mut body = String::new();
        write_blocks(tree, source, item, &cont, &mut body);
        out.push(' ');
        out.push_str(body.strip_prefix(cont.as_str()).unwrap_or(&body));
    }

    pub(crate) fn write_inlines(
        tree: &Tree,
        source: &SourceBuffer,
        parent: NodeId,
        breaks: Breaks<'_>,
        out: &mut String,
    ) {
        for child in tree.children(parent) {
            write_inline(tree, source, child, breaks, out);
        }
    }

    pub(crate) fn write_inline(
        tree: &Tree,
        source: &SourceBuffer,
        id: NodeId,
        breaks: Breaks<'_>,
        out: &mut String,
    ) {
        match tree.kind(id) {
            NodeKind::Text {
                segment,
                soft_break,
            } => {
                out.push_str(source.slice(*segment));
                if *soft_break {
                    match breaks {
                        Breaks::Line(indent) => {
                            out.push('\n');
                            out.push_str(indent);
                        }
                        Breaks::Space => out.push(' '),
                    }
                }
            }
            NodeKind::Checkbox { checked } => out.push_str(if *checked { "[x] " } else { "[ ] " }),
            NodeKind::CodeSpan { ticks } => {
                let run = "`".repeat(*ticks);
                out.push_str(&run);
                write_inlines(tree, source, id, breaks, out);
                out.push_str(&run);
            }
            NodeKind::Link { destination, title } | NodeKind::Image { destination, title } => {
                if matches!(tree.kind(id), NodeKind::Image { .. }) {
                    out.push('!');
                }
                out.push('[');
                write_inlines(tree, source, id, breaks, out);
                out.push_str("](");
                out.push_str(source.slice(*destination));
                if let Some(title) = title {
                    out.push_str(" \"");
                    out.push_str(source.slice(*title));
                    out.push('"');
                }
                out.push(')');
            }
            NodeKind::Emphasis { level, delimiter } => {
                let run = delimiter.to_string().repeat(*level as usize);
                out.push_str(&run);
                write_inlines(tree, source, id, breaks, out);
                out.push_str(&run);
            }
            NodeKind::Strikethrough => {
                out.push_str("~~");
                write_inlines(tree, source, id, breaks, out);
                out.push_str("~~");
            }
            _ => write_inlines(tree, source, id, breaks, out),
        }
    }

}

pub mod extract {
    use crate::annotations;
    use crate::core::*;
    use crate::format::{Breaks, write_inline, write_inlines};

    /// Where a todo lives in the tree.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TodoLocation {
        pub item: NodeId,
        pub paragraph: NodeId,
        pub checkbox: NodeId,
        pub depth: usize,
    }

    #[derive(Default)]
    struct Walk {
        todos: Vec<TodoLocation>,
        headings: Vec<(NodeId, usize)>,
    }

    impl Walk {
        fn visit(&mut self, tree: &Tree, id: NodeId, depth: usize) {
            let child_depth = match tree.kind(id) {
                NodeKind::Heading { .. } => {
                    self.headings.push((id, self.todos.len()));
                    depth
                }
                NodeKind::ListItem => match tree.task_parts(id) {
                    Some((paragraph, checkbox)) => {
                        self.todos.push(TodoLocation {
                            item: id,
                            paragraph,
                            checkbox,
                            depth,
                        });
                        depth + 1
                    }
                    None => depth,
                },
                _ => depth,
            };
            for child in tree.children(id) {
                self.visit(tree, child, child_depth);
            }
        }
    }

    fn walk(tree: &Tree) -> Walk {
        let mut walk = Walk::default();
        walk.visit(tree, tree.root(), 0);
        walk
    }

    pub(crate) fn locate_todos(tree: &Tree) -> Vec<TodoLocation> {
        walk(tree).todos
    }

    /// Markdown text of a todo's paragraph, checkbox excluded, soft breaks flattened.
    pub(crate) fn todo_text(tree: &Tree, source: &SourceBuffer, loc: &TodoLocation) -> String {
        let mut out = String::new();
        for child in tree.children(loc.paragraph) {
            if child != loc.checkbox {
                write_inline(tree, source, child, Breaks::Space, &mut out);
            }
        }
        out.trim().to_string()
    }

    pub fn extract_todos(tree: &Tree, source: &SourceBuffer) -> Vec<Todo> {
        let locations = locate_todos(tree);
        let mut last_at_depth: Vec<usize> = Vec::new();
        let mut todos = Vec::with_capacity(locations.len());
        for (index, loc) in locations.iter().enumerate() {
            let parent_index = match loc.depth {
                0 => None,
                d => last_at_depth.get(d - 1).copied(),
            };
            last_at_depth.truncate(loc.depth);
            last_at_depth.push(index);

            let checked = matches!(tree.kind(loc.checkbox), NodeKind::Checkbox { checked: true });
            let text = todo_text(tree, source, loc);
            todos.push(Todo {
                index,
                checked,
                tags: annotations::extract_tags(&text),
                priority: annotations::extract_priority(&text),
                due_date: annotations::extract_due_date(&text),
                text,
                depth: loc.depth,
                parent_index,
            });
        }
        todos
    }

    pub fn extract_headings(tree: &Tree, source: &SourceBuffer) -> Vec<Heading> {
        walk(tree)
            .headings
            .into_iter()
            .map(|(id, before_todo_index)| {
                let level = match tree.kind(id) {
                    NodeKind::Heading { level } => *level,
                    _ => 0,
                };
                let mut text = String::new();
                write_inlines(tree, source, id, Breaks::Space, &mut text);
                Heading {
                    level,
                    text: text.trim().to_string(),
                    before_todo_index,
                }
            })
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_markdown;

        fn todos(input: &str) -> Vec<Todo> {
            let (source, tree) = parse_markdown(input);
            extract_todos(&tree, &source)
        }

        fn assert_depth_parent_law(todos: &[Todo]) {
            for (i, t) in todos.iter().enumerate() {
                let expected = if t.depth == 0 {
                    None
                } else {
                    (0..i).rev().find(|&j| todos[j].depth == t.depth - 1)
                };
                assert_eq!(t.parent_index, expected, "todo {i} ({:?})", t.text);
            }
        }

        #[test]
        fn nested_depths_and_parents() {
            let todos = todos(
                r#"- [ ] Task 1
- [ ] Task 2
  - [x] Subtask a
  - [ ] Subtask b
- [ ] Task 3
"#,
            );
            let depths: Vec<_> = todos.iter().map(|t| t.depth).collect();
            let parents: Vec<_> = todos.iter().map(|t| t.parent_index).collect();
            assert_eq!(depths, vec![0, 0, 1, 1, 0]);
            assert_eq!(parents, vec![None, None, Some(1), Some(1), None]);
            assert!(todos[2].checked);
            assert_eq!(todos[3].text, "Subtask b");
        }

        #[test]
        fn deep_nesting_obeys_parent_law() {
            let todos = todos(
                r#"# A
- [ ] a
  - [ ] a.1
    - [ ] a.1.i
  - [ ] a.2
- [ ] b
    - [ ] b.1
- plain
  - [ ] under plain

## B
* [ ] c
  1. [ ] c.1
  2. [ ] c.2
     - [ ] c.2.i
"#,
            );
            assert_eq!(todos.len(), 11);
            let depths: Vec<_> = todos.iter().map(|t| t.depth).collect();
            assert_eq!(depths, vec![0, 1, 2, 1, 0, 1, 0, 0, 1, 1, 2]);
            assert_depth_parent_law(&todos);
        }

        #[test]
        fn text_keeps_inline_markdown_and_flattens_breaks() {
            let todos = todos(
                "- [ ] Update `config.yaml` per [docs](https://d.io) **now**\n  and _later_\n",
            );
            assert_eq!(
                todos[0].text,
                "Update `config.yaml` per [docs](https://d.io) **now** and _later_"
            );
        }

        #[test]
        fn annotations_are_read_from_text() {
            let todos = todos("- [ ] Fix bug !p2 @due(2025-11-30) #urgent #backend #urgent\n");
            let t = &todos[0];
            assert_eq!(t.priority, Some(2));
            assert_eq!(t.due_date, chrono::NaiveDate::from_ymd_opt(2025, 11, 30));
            assert_eq!(t.tags, vec!["urgent".to_string(), "backend".to_string()]);
        }

        #[test]
        fn headings_point_at_next_todo() {
            let input = "# Top\n\n- [ ] a\n- [ ] b\n\n## Mid `x`\n\n- [ ] c\n\n## End\n";
            let (source, tree) = parse_markdown(input);
            let headings = extract_headings(&tree, &source);
            let summary: Vec<_> = headings
                .iter()
                .map(|h| (h.level, h.text.as_str(), h.before_todo_index))
                .collect();
            assert_eq!(
                summary,
                vec![(1, "Top", 0), (2, "Mid `x`", 2), (2, "End", 3)]
            );
        }

        #[test]
        fn task_count_matches_markers() {
            let input = "- [ ] a\n- b\n- [x] c\n  > - [ ] quoted task\n";
            let todos = todos(input);
            assert_eq!(todos.len(), 3);
            assert_eq!(todos[2].text, "quoted task");
        }
    }
}

pub mod edit {
    //! Structural edits addressed by todo index (extraction order).
    //!
    //! Each operation resolves indices against a fresh extraction, mutates the arena, and leaves
    //! the caller to re-extract. Replaced text is appended to the source buffer, never rewritten.

    use std::borrow::Cow;

    use crate::core::*;
    use crate::extract::{TodoLocation, locate_todos};
    use crate::parser::attach_fragment;

    fn locate(tree: &Tree, index: usize) -> Result<TodoLocation, EditError> {
        let todos = locate_todos(tree);
        let len = todos.len();
        todos
            .get(index)
            .copied()
            .ok_or(EditError::IndexOutOfRange { index, len })
    }

    /// Detaches `list` if an edit left it without items, then any blockquote emptied by that.
    fn prune_empty_list(tree: &mut Tree, list: Option<NodeId>) {
        let mut next = list;
        while let Some(id) = next {
            let container = tree.kind(id).is_list() || matches!(tree.kind(id), NodeKind::Blockquote);
            if !container || tree.first_child(id).is_some() {
                break;
            }
            next = tree.parent(id);
            tree.detach(id);
        }
    }

    /// Todo text is a single paragraph line; continuation lines are joined with spaces so a
    /// line such as `- [ ] x` or `# h` cannot turn into a block when the file is re-read.
    fn single_line(text: &str) -> Cow<'_, str> {
        if !text.contains(['\n', '\r']) {
            return Cow::Borrowed(text);
        }
        let joined = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Cow::Owned(joined)
    }

    fn new_task_item(tree: &mut Tree, source: &mut SourceBuffer, text: &str, checked: bool) -> NodeId {
        let item = tree.alloc(NodeKind::ListItem);
        let para = tree.alloc(NodeKind::Paragraph);
        let checkbox = tree.alloc(NodeKind::Checkbox { checked });
        tree.append_child(item, para);
        tree.append_child(para, checkbox);
        let text = single_line(text);
        let seg = source.append(&text);
        attach_fragment(tree, para, &text, seg.start);
        item
    }

    pub fn toggle_check(tree: &mut Tree, index: usize) -> Result<(), EditError> {
        let loc = locate(tree, index)?;
        if let NodeKind::Checkbox { checked } = tree.kind_mut(loc.checkbox) {
            *checked = !*checked;
            tracing::debug!(index, checked = *checked, "toggled todo");
        }
        Ok(())
    }

    /// Replaces the item's inline content with `text` parsed as markdown; the checkbox stays.
    /// Line breaks in `text` become spaces.
    pub fn set_text(
        tree: &mut Tree,
        source: &mut SourceBuffer,
        index: usize,
        text: &str,
    ) -> Result<(), EditError> {
        let loc = locate(tree, index)?;
        let old: Vec<NodeId> = tree
            .children(loc.paragraph)
            .filter(|c| *c != loc.checkbox)
            .collect();
        for child in old {
            tree.detach(child);
        }
        let text = single_line(text);
        let seg = source.append(&text);
        attach_fragment(tree, loc.paragraph, &text, seg.start);
        tracing::debug!(index, bytes = text.len(), "replaced todo text");
        Ok(())
    }

    /// Inserts a new task item and returns its index.
    ///
    /// With `after = None` the item goes to the head of the first task list, and a `-` list is
    /// appended to the document when there is none. Otherwise it follows item `after` in the
    /// same list.
    pub fn insert(
        tree: &mut Tree,
        source: &mut SourceBuffer,
        after: Option<usize>,
        text: &str,
        checked: bool,
    ) -> Result<usize, EditError> {
        let anchor = after.map(|i| locate(tree, i)).transpose()?;
        let item = new_task_item(tree, source, text, checked);
        match anchor {
            Some(loc) => tree.insert_after(loc.item, item),
            None => {
                let first = task_lists(tree).next();
                match first {
                    Some(list) => tree.prepend_child(list, item),
                    None => append_new_list(tree, item),
                }
            }
        }
        let index = index_of(tree, item)?;
        tracing::debug!(index, ?after, "inserted todo");
        Ok(index)
    }

    /// Appends a new task item to the end of the last outermost task list and returns its
    /// index, which is always the last one. A `-` list is appended to the document when there
    /// is none.
    pub fn append(
        tree: &mut Tree,
        source: &mut SourceBuffer,
        text: &str,
        checked: bool,
    ) -> Result<usize, EditError> {
        let item = new_task_item(tree, source, text, checked);
        let last = task_lists(tree)
            .filter(|list| {
                !std::iter::successors(tree.parent(*list), |id| tree.parent(*id))
                    .any(|id| tree.kind(id).is_list())
            })
            .last();
        match last {
            Some(list) => tree.append_child(list, item),
            None => append_new_list(tree, item),
        }
        let index = index_of(tree, item)?;
        tracing::debug!(index, "appended todo");
        Ok(index)
    }

    fn append_new_list(tree: &mut Tree, item: NodeId) {
        let list = tree.alloc(NodeKind::List {
            marker: ListMarker::Bullet('-'),
        });
        let root = tree.root();
        tree.append_child(root, list);
        tree.append_child(list, item);
    }

    fn index_of(tree: &Tree, item: NodeId) -> Result<usize, EditError> {
        let todos = locate_todos(tree);
        todos
            .iter()
            .position(|loc| loc.item == item)
            .ok_or(EditError::NotFound { index: todos.len() })
    }

    /// Lists in document order that hold a checkbox anywhere inside one of their items.
    fn task_lists(tree: &Tree) -> impl Iterator<Item = NodeId> + '_ {
        tree.descendants(tree.root()).filter(move |id| {
            tree.kind(*id).is_list()
                && tree.descendants(*id).any(|n| matches!(tree.kind(n), NodeKind::Checkbox { .. }))
        })
    }

    /// Removes item `index`. Items of its sublists move up into its place, in order.
    pub fn delete(tree: &mut Tree, index: usize) -> Result<(), EditError> {
        let loc = locate(tree, index)?;
        let item = loc.item;
        let promoted: Vec<NodeId> = tree
            .children(item)
            .filter(|c| tree.kind(*c).is_list())
            .flat_map(|list| tree.children(list).collect::<Vec<_>>())
            .collect();
        let blank = tree.blank_before(item);
        for (n, child) in promoted.iter().enumerate() {
            tree.insert_before(item, *child);
            if n == 0 {
                tree.set_blank_before(*child, blank);
            }
        }
        let list = tree.parent(item);
        tree.detach(item);
        prune_empty_list(tree, list);
        tracing::debug!(index, promoted = promoted.len(), "deleted todo");
        Ok(())
    }

    /// Moves item `from` (with its subtree) next to item `to`, possibly into another list.
    pub fn move_todo(tree: &mut Tree, from: usize, to: usize, after: bool) -> Result<(), EditError> {
        if from == to {
            return Ok(());
        }
        let todos = locate_todos(tree);
        let source_item = todos.get(from).ok_or(EditError::NotFound { index: from })?.item;
        let target_item = todos.get(to).ok_or(EditError::NotFound { index: to })?.item;
        if tree.is_ancestor_or_self(source_item, target_item) {
            return Err(EditError::TargetInsideSource { from, to });
        }
        let old_list = tree.parent(source_item);
        tree.detach(source_item);
        if after {
            tree.insert_after(target_item, source_item);
        } else {
            tree.insert_before(target_item, source_item);
        }
        prune_empty_list(tree, old_list);
        tracing::debug!(from, to, after, "moved todo");
        Ok(())
    }

    /// Exchanges the positions of two items. Superseded by [`move_todo`].
    pub fn swap(tree: &mut Tree, i: usize, j: usize) -> Result<(), EditError> {
        if i == j {
            return Ok(());
        }
        let a = locate(tree, i)?.item;
        let b = locate(tree, j)?.item;
        if tree.is_ancestor_or_self(a, b) || tree.is_ancestor_or_self(b, a) {
            return Err(EditError::TargetInsideSource { from: i, to: j });
        }

        if tree.next_sibling(a) == Some(b) {
            tree.insert_before(a, b);
        } else if tree.next_sibling(b) == Some(a) {
            tree.insert_before(b, a);
        } else {
            // Anchors are captured before either item is unlinked.
            let (prev_a, parent_a) = (tree.prev_sibling(a), tree.parent(a));
            let (prev_b, parent_b) = (tree.prev_sibling(b), tree.parent(b));
            let (Some(parent_a), Some(parent_b)) = (parent_a, parent_b) else {
                return Err(EditError::NotFound { index: i });
            };
            tree.detach(a);
            tree.detach(b);
            match prev_b {
                Some(p) => tree.insert_after(p, a),
                None => tree.prepend_child(parent_b, a),
            }
            match prev_a {
                Some(p) => tree.insert_after(p, b),
                None => tree.prepend_child(parent_a, b),
            }
        }
        tracing::debug!(i, j, "swapped todos");
        Ok(())
    }

    /// Makes item `index` the last child of its previous sibling's sublist.
    pub fn indent(tree: &mut Tree, index: usize) -> Result<(), EditError> {
        let loc = locate(tree, index)?;
        let item = loc.item;
        let prev = tree
            .prev_sibling(item)
            .ok_or(EditError::NoPreviousSibling { index })?;
        let sublist = match tree.last_child(prev) {
            Some(last) if tree.kind(last).is_list() => last,
            _ => {
                let marker = match tree.parent(item).map(|p| tree.kind(p)) {
                    Some(NodeKind::List {
                        marker: ListMarker::Ordered { delimiter, .. },
                    }) => ListMarker::Ordered {
                        start: 1,
                        delimiter: *delimiter,
                    },
                    Some(NodeKind::List { marker }) => *marker,
                    _ => ListMarker::Bullet('-'),
                };
                let list = tree.alloc(NodeKind::List { marker });
                tree.append_child(prev, list);
                list
            }
        };
        tree.append_child(sublist, item);
        tree.set_blank_before(item, None);
        tracing::debug!(index, depth = loc.depth + 1, "indented todo");
        Ok(())
    }

    /// Moves item `index` out to sit right after the task item it is nested under.
    pub fn outdent(tree: &mut Tree, index: usize) -> Result<(), EditError> {
        let loc = locate(tree, index)?;
        let item = loc.item;
        let list = tree.parent(item);
        let parent_task = std::iter::successors(list, |id| tree.parent(*id))
            .find(|id| tree.is_task_item(*id));
        let parent_task = match parent_task {
            Some(p) if loc.depth > 0 => p,
            _ => return Err(EditError::AlreadyTopLevel { index }),
        };
        tree.insert_after(parent_task, item);
        tree.set_blank_before(item, None);
        prune_empty_list(tree, list);
        tracing::debug!(index, depth = loc.depth - 1, "outdented todo");
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::extract::extract_todos;
        use crate::format::format_document;
        use crate::metadata::Metadata;
        use crate::parser::parse_markdown;

        struct Fixture {
            source: SourceBuffer,
            tree: Tree,
        }

        impl Fixture {
            fn new(input: &str) -> Self {
                let (source, tree) = parse_markdown(input);
                Self { source, tree }
            }

            fn todos(&self) -> Vec<Todo> {
                extract_todos(&self.tree, &self.source)
            }

            fn texts(&self) -> Vec<String> {
                self.todos().into_iter().map(|t| t.text).collect()
            }

            fn shape(&self) -> Vec<(String, usize)> {
                self.todos().into_iter().map(|t| (t.text, t.depth)).collect()
            }

            fn render(&self) -> String {
                format_document(&self.tree, &self.source, &Metadata::default())
            }
        }

        fn shape(items: &[(&str, usize)]) -> Vec<(String, usize)> {
            items.iter().map(|(t, d)| (t.to_string(), *d)).collect()
        }

        const NESTED: &str = r#"# Todos

- [ ] Task 1
- [ ] Task 2
  - [x] Subtask a
  - [ ] Subtask b
- [ ] Task 3
"#;

        #[test]
        fn toggle_only_flips_the_checkbox() {
            let mut f = Fixture::new(NESTED);
            toggle_check(&mut f.tree, 2).expect("toggle");
            assert!(!f.todos()[2].checked);
            assert_eq!(f.render(), NESTED.replace("[x] Subtask a", "[ ] Subtask a"));
            assert_eq!(
                toggle_check(&mut f.tree, 5),
                Err(EditError::IndexOutOfRange { index: 5, len: 5 })
            );
        }

        #[test]
        fn set_text_keeps_inline_structure_through_a_round_trip() {
            let mut f = Fixture::new(NESTED);
            set_text(&mut f.tree, &mut f.source, 0, "Update `config.yaml` file").expect("set");
            let rendered = f.render();
            assert!(rendered.contains("- [ ] Update `config.yaml` file\n"));
            let reparsed = Fixture::new(&rendered);
            assert_eq!(reparsed.todos()[0].text, "Update `config.yaml` file");
            let has_code = reparsed
                .tree
                .descendants(reparsed.tree.root())
                .any(|n| matches!(reparsed.tree.kind(n), NodeKind::CodeSpan { .. }));
            assert!(has_code);
        }

        #[test]
        fn set_text_appends_to_the_buffer_without_touching_old_bytes() {
            let mut f = Fixture::new(NESTED);
            let before = f.source.as_str().to_string();
            set_text(&mut f.tree, &mut f.source, 1, "Renamed").expect("set");
            assert!(f.source.as_str().starts_with(&before));
            assert_eq!(f.texts()[1], "Renamed");
            assert_eq!(f.todos()[2].text, "Subtask a");
        }

        #[test]
        fn insert_at_head_of_first_task_list() {
            let mut f = Fixture::new("# T\n\nIntro\n\n- plain\n\n- [ ] a\n- [ ] b\n");
            let index = insert(&mut f.tree, &mut f.source, None, "new", false).expect("insert");
            assert_eq!(index, 0);
            assert_eq!(f.texts(), vec!["new", "a", "b"]);
        }

        #[test]
        fn insert_creates_a_list_when_none_exists() {
            let mut f = Fixture::new("# Notes\n\nJust text.\n");
            let index = insert(&mut f.tree, &mut f.source, None, "first", true).expect("insert");
            assert_eq!(index, 0);
            assert_eq!(f.render(), "# Notes\n\nJust text.\n- [x] first\n");
            let reparsed = Fixture::new(&f.render());
            assert_eq!(reparsed.texts(), vec!["first"]);
        }

        #[test]
        fn insert_after_keeps_the_anchor_depth() {
            let mut f = Fixture::new(NESTED);
            let index =
                insert(&mut f.tree, &mut f.source, Some(2), "Subtask a2", false).expect("insert");
            assert_eq!(index, 3);
            assert_eq!(f.todos()[3].depth, 1);
            assert_eq!(f.todos()[3].parent_index, Some(1));
            assert!(matches!(
                insert(&mut f.tree, &mut f.source, Some(9), "x", false),
                Err(EditError::IndexOutOfRange { index: 9, .. })
            ));
        }

        #[test]
        fn delete_promotes_children_into_the_parent_list() {
            let mut f = Fixture::new("- [ ] Parent\n  - [ ] Child 1\n  - [ ] Child 2\n- [ ] Sibling\n");
            delete(&mut f.tree, 0).expect("delete");
            assert_eq!(
                f.shape(),
                shape(&[("Child 1", 0), ("Child 2", 0), ("Sibling", 0)])
            );
            assert_eq!(f.render(), "# Todos\n\n- [ ] Child 1\n- [ ] Child 2\n- [ ] Sibling\n");
        }

        #[test]
        fn delete_promotion_shifts_whole_subtrees_up_one_level() {
            let mut f = Fixture::new(
                "- [ ] a\n- [ ] k\n  - [ ] c1\n    - [ ] g1\n  - [ ] c2\n- [ ] z\n",
            );
            let before = f.todos();
            delete(&mut f.tree, 1).expect("delete");
            let after = f.todos();
            assert_eq!(after.len(), before.len() - 1);
            for (moved, orig) in after[1..4].iter().zip(&before[2..5]) {
                assert_eq!(moved.text, orig.text);
                assert_eq!(moved.depth, orig.depth - 1);
            }
            assert_eq!(after[4].text, "z");
        }

        #[test]
        fn delete_last_item_drops_the_empty_sublist() {
            let mut f = Fixture::new("- [ ] a\n  - [ ] b\n");
            delete(&mut f.tree, 1).expect("delete");
            assert_eq!(f.render(), "# Todos\n\n- [ ] a\n");
        }

        #[test]
        fn move_within_a_list() {
            let mut f = Fixture::new("- [ ] a\n- [ ] b\n- [ ] c\n");
            move_todo(&mut f.tree, 0, 2, true).expect("move");
            assert_eq!(f.texts(), vec!["b", "c", "a"]);
            move_todo(&mut f.tree, 2, 0, false).expect("move");
            assert_eq!(f.texts(), vec!["a", "b", "c"]);
            move_todo(&mut f.tree, 1, 1, false).expect("noop");
            assert_eq!(f.texts(), vec!["a", "b", "c"]);
        }

        #[test]
        fn move_across_lists_adopts_target_depth() {
            let mut f = Fixture::new(NESTED);
            move_todo(&mut f.tree, 4, 2, false).expect("move");
            assert_eq!(
                f.shape(),
                shape(&[
                    ("Task 1", 0),
                    ("Task 2", 0),
                    ("Task 3", 1),
                    ("Subtask a", 1),
                    ("Subtask b", 1)
                ])
            );
            move_todo(&mut f.tree, 3, 0, false).expect("move");
            assert_eq!(f.todos()[0].text, "Subtask a");
            assert_eq!(f.todos()[0].depth, 0);
        }

        #[test]
        fn move_rejects_missing_and_nested_targets() {
            let mut f = Fixture::new(NESTED);
            assert_eq!(
                move_todo(&mut f.tree, 0, 7, false),
                Err(EditError::NotFound { index: 7 })
            );
            assert_eq!(
                move_todo(&mut f.tree, 8, 0, true),
                Err(EditError::NotFound { index: 8 })
            );
            assert_eq!(
                move_todo(&mut f.tree, 1, 2, true),
                Err(EditError::TargetInsideSource { from: 1, to: 2 })
            );
        }

        #[test]
        fn move_out_of_a_sublist_prunes_it() {
            let mut f = Fixture::new("- [ ] a\n  - [ ] b\n- [ ] c\n");
            move_todo(&mut f.tree, 1, 2, true).expect("move");
            assert_eq!(f.render(), "# Todos\n\n- [ ] a\n- [ ] c\n- [ ] b\n");
        }

        #[test]
        fn swap_adjacent_and_distant_items() {
            let mut f = Fixture::new("- [ ] a\n- [ ] b\n- [ ] c\n- [ ] d\n");
            swap(&mut f.tree, 0, 1).expect("adjacent");
            assert_eq!(f.texts(), vec!["b", "a", "c", "d"]);
            swap(&mut f.tree, 2, 1).expect("adjacent reversed");
            assert_eq!(f.texts(), vec!["b", "c", "a", "d"]);
            swap(&mut f.tree, 0, 3).expect("distant");
            assert_eq!(f.texts(), vec!["d", "c", "a", "b"]);
            swap(&mut f.tree, 1, 1).expect("noop");
            assert_eq!(f.texts(), vec!["d", "c", "a", "b"]);
        }

        #[test]
        fn swap_across_lists() {
            let mut f = Fixture::new(NESTED);
            swap(&mut f.tree, 0, 3).expect("swap");
            assert_eq!(
                f.shape(),
                shape(&[
                    ("Subtask b", 0),
                    ("Task 2", 0),
                    ("Subtask a", 1),
                    ("Task 1", 1),
                    ("Task 3", 0)
                ])
            );
        }

        #[test]
        fn indent_requires_a_previous_sibling() {
            let mut f = Fixture::new(NESTED);
            assert_eq!(
                indent(&mut f.tree, 0),
                Err(EditError::NoPreviousSibling { index: 0 })
            );
            assert_eq!(
                indent(&mut f.tree, 2),
                Err(EditError::NoPreviousSibling { index: 2 })
            );
            assert!(indent(&mut f.tree, 0).unwrap_err().is_structural());
        }

        #[test]
        fn indent_appends_to_existing_sublist() {
            let mut f = Fixture::new(NESTED);
            indent(&mut f.tree, 4).expect("indent");
            assert_eq!(
                f.shape(),
                shape(&[
                    ("Task 1", 0),
                    ("Task 2", 0),
                    ("Subtask a", 1),
                    ("Subtask b", 1),
                    ("Task 3", 1)
                ])
            );
            assert_eq!(f.todos()[4].parent_index, Some(1));
        }

        #[test]
        fn outdent_at_top_level_fails() {
            let mut f = Fixture::new(NESTED);
            assert_eq!(
                outdent(&mut f.tree, 1),
                Err(EditError::AlreadyTopLevel { index: 1 })
            );
        }

        #[test]
        fn indent_then_outdent_restores_depth_one() {
            let mut f = Fixture::new(NESTED);
            let original = f.render();
            indent(&mut f.tree, 1).expect("indent");
            assert_eq!(f.todos()[1].depth, 1);
            assert_eq!(f.todos()[1].parent_index, Some(0));
            outdent(&mut f.tree, 1).expect("outdent");
            assert_eq!(f.render(), original);
        }

        #[test]
        fn outdent_then_indent_restores_depth_two() {
            let input = "- [ ] a\n  - [ ] b\n    - [ ] c\n    - [ ] d\n- [ ] e\n";
            let mut f = Fixture::new(input);
            let original = f.shape();
            outdent(&mut f.tree, 3).expect("outdent");
            assert_eq!(f.todos()[3].depth, 1);
            assert_eq!(f.todos()[3].parent_index, Some(0));
            indent(&mut f.tree, 3).expect("indent");
            assert_eq!(f.shape(), original);
            assert_eq!(f.render(), format!("# Todos\n\n{input}"));
        }

        #[test]
        fn indent_at_depth_two_creates_a_sublist() {
            let input = "- [ ] a\n  - [ ] b\n    - [ ] c\n    - [ ] d\n- [ ] e\n";
            let mut f = Fixture::new(input);
            indent(&mut f.tree, 3).expect("indent");
            assert_eq!(f.todos()[3].depth, 3);
            assert_eq!(f.todos()[3].parent_index, Some(2));
            assert_eq!(
                f.render(),
                "# Todos\n\n- [ ] a\n  - [ ] b\n    - [ ] c\n      - [ ] d\n- [ ] e\n"
            );
            outdent(&mut f.tree, 3).expect("outdent");
            assert_eq!(f.render(), format!("# Todos\n\n{input}"));
        }

        #[test]
        fn outdent_skips_plain_items_between_task_levels() {
            let mut f = Fixture::new("- [ ] a\n  - note\n    - [ ] b\n");
            assert_eq!(f.todos()[1].depth, 1);
            outdent(&mut f.tree, 1).expect("outdent");
            assert_eq!(f.shape(), shape(&[("a", 0), ("b", 0)]));
            assert_eq!(f.todos()[1].parent_index, None);
            assert_eq!(Fixture::new(&f.render()).shape(), f.shape());
        }

        #[test]
        fn outdent_leaves_a_blockquote_under_a_task() {
            let mut f = Fixture::new("- [ ] a\n  > - [ ] b\n");
            assert_eq!(f.todos()[1].depth, 1);
            outdent(&mut f.tree, 1).expect("outdent");
            assert_eq!(f.shape(), shape(&[("a", 0), ("b", 0)]));
            assert!(!f.render().contains('>'));
            assert_eq!(Fixture::new(&f.render()).shape(), f.shape());
        }

        #[test]
        fn multi_line_text_stays_one_todo_after_reparse() {
            let mut f = Fixture::new("- [ ] a\n");
            set_text(&mut f.tree, &mut f.source, 0, "fix\n- [ ] injected").expect("set text");
            insert(&mut f.tree, &mut f.source, Some(0), "new\n# heading\n> quote", false)
                .expect("insert");
            let texts = vec!["fix - [ ] injected", "new # heading > quote"];
            assert_eq!(f.texts(), texts);
            let reparsed = Fixture::new(&f.render());
            assert_eq!(reparsed.texts(), texts);
            assert!(reparsed.todos().iter().all(|t| t.depth == 0));
        }

        #[test]
        fn append_goes_to_the_end_of_the_last_task_list() {
            let mut f = Fixture::new("- [ ] a\n\nNotes\n\n- [ ] b\n  - [ ] c\n- [ ] d\n\n- plain\n");
            let index = append(&mut f.tree, &mut f.source, "new", false).expect("append");
            assert_eq!(index, 4);
            assert_eq!(
                f.shape(),
                shape(&[("a", 0), ("b", 0), ("c", 1), ("d", 0), ("new", 0)])
            );
            assert_eq!(Fixture::new(&f.render()).shape(), f.shape());
        }

        #[test]
        fn append_creates_a_list_when_none_exists() {
            let mut f = Fixture::new("# Notes\n\nJust text.\n");
            let index = append(&mut f.tree, &mut f.source, "first", false).expect("append");
            assert_eq!(index, 0);
            assert_eq!(f.render(), "# Notes\n\nJust text.\n- [ ] first\n");
        }

        #[test]
        fn indent_in_ordered_list_starts_a_new_numbered_sublist() {
            let mut f = Fixture::new("1. [ ] a\n2. [ ] b\n");
            indent(&mut f.tree, 1).expect("indent");
            assert_eq!(f.render(), "# Todos\n\n1. [ ] a\n   1. [ ] b\n");
        }
    }
}

pub mod metadata {
    //! YAML frontmatter carrying per-document view options.

    use serde::{Deserialize, Serialize};
    use serde_with::skip_serializing_none;

    #[skip_serializing_none]
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case", deny_unknown_fields)]
    pub struct Metadata {
        pub filter_done: Option<bool>,
        pub max_visible: Option<usize>,
        pub show_headings: Option<bool>,
        pub read_only: Option<bool>,
        pub word_wrap: Option<bool>,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum MetadataError {
        #[error("invalid frontmatter: {0}")]
        Decode(#[from] serde_yaml::Error),
        #[error("failed to encode frontmatter: {0}")]
        Encode(#[source] serde_yaml::Error),
    }

    impl Metadata {
        pub fn is_empty(&self) -> bool {
            *self == Self::default()
        }

        /// `---` delimited block for the top of the file; `None` when nothing is set.
        pub fn to_block(&self) -> Result<Option<String>, MetadataError> {
            if self.is_empty() {
                return Ok(None);
            }
            let yaml = serde_yaml::to_string(self).map_err(MetadataError::Encode)?;
            Ok(Some(format!("---\n{yaml}---\n")))
        }
    }

    /// Frontmatter split off the body.
    #[derive(Debug)]
    pub struct Frontmatter<'a> {
        pub metadata: Metadata,
        pub body: &'a str,
        /// Set when a block was present but did not decode; `metadata` is then empty.
        pub error: Option<MetadataError>,
    }

    /// Splits a leading `---` block from `input` and decodes it.
    ///
    /// A block that fails to decode is still removed from the body, so a typo in the options
    /// never leaks YAML into the todo list.
    pub fn parse_frontmatter(input: &str) -> Frontmatter<'_> {
        let Some((yaml, body)) = split_block(input) else {
            return Frontmatter {
                metadata: Metadata::default(),
                body: input,
                error: None,
            };
        };
        if yaml.trim().is_empty() {
            return Frontmatter {
                metadata: Metadata::default(),
                body,
                error: None,
            };
        }
        match serde_yaml::from_str::<Metadata>(yaml) {
            Ok(metadata) => Frontmatter {
                metadata,
                body,
                error: None,
            },
            Err(err) => {
                tracing::warn!(error = %err, "ignoring frontmatter that failed to decode");
                Frontmatter {
                    metadata: Metadata::default(),
                    body,
                    error: Some(MetadataError::Decode(err)),
                }
            }
        }
    }

    fn split_block(input: &str) -> Option<(&str, &str)> {
        let mut lines = input.split_inclusive('\n');
        let open = lines.next()?;
        if !open.ends_with('\n') || open.trim_end() != "---" {
            return None;
        }
        let yaml_start = open.len();
        let mut pos = yaml_start;
        for line in lines {
            if pos > yaml_start && line.ends_with('\n') && line.trim_end() == "---" {
                return Some((&input[yaml_start..pos], &input[pos + line.len()..]));
            }
            pos += line.len();
        }
        None
    }

}

pub mod annotations {
    //! `#tag`, `!pN` and `@due(YYYY-MM-DD)` markers inside todo text.

    use std::collections::BTreeSet;
    use std::ops::Range;

    use chrono::{Days, NaiveDate};
    use indexmap::IndexSet;
    use nom::{
        IResult,
        bytes::complete::{tag, take_while_m_n, take_while1},
        character::complete::{char, digit1},
        combinator::recognize,
        error::VerboseError,
        sequence::{delimited, preceded, tuple},
    };

    use crate::core::Todo;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn tag_token(i: &str) -> PResult<'_, &str> {
        preceded(
            char('#'),
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
        )(i)
    }

    fn priority_token(i: &str) -> PResult<'_, &str> {
        preceded(tag("!p"), digit1)(i)
    }

    fn digits<'a>(n: usize) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
        take_while_m_n(n, n, |c: char| c.is_ascii_digit())
    }

    fn due_token(i: &str) -> PResult<'_, &str> {
        delimited(
            tag("@due("),
            recognize(tuple((digits(4), char('-'), digits(2), char('-'), digits(2)))),
            char(')'),
        )(i)
    }

    /// Leftmost non-overlapping matches of `marker`, with their byte ranges.
    fn find_all<'a>(
        text: &'a str,
        marker: fn(&'a str) -> PResult<'a, &'a str>,
    ) -> Vec<(Range<usize>, &'a str)> {
        let mut found = Vec::new();
        let mut pos = 0;
        while pos < text.len() {
            let rest = &text[pos..];
            match marker(rest) {
                Ok((after, value)) => {
                    let end = text.len() - after.len();
                    found.push((pos..end, value));
                    pos = end;
                }
                Err(_) => pos += rest.chars().next().map_or(1, char::len_utf8),
            }
        }
        found
    }

    fn remove_all<'a>(text: &'a str, marker: fn(&'a str) -> PResult<'a, &'a str>) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for (range, _) in find_all(text, marker) {
            out.push_str(&text[last..range.start]);
            last = range.end;
        }
        out.push_str(&text[last..]);
        out.trim().to_string()
    }

    fn first_match<'a>(text: &'a str, marker: fn(&'a str) -> PResult<'a, &'a str>) -> Option<&'a str> {
        find_all(text, marker)
            .into_iter()
            .next()
            .map(|(range, _)| &text[range])
    }

    /* -------------------------------- Tags -------------------------------- */

    /// Tags in order of first appearance, without the `#`.
    pub fn extract_tags(text: &str) -> Vec<String> {
        find_all(text, tag_token)
            .into_iter()
            .map(|(_, name)| name)
            .collect::<IndexSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn remove_tags(text: &str) -> String {
        remove_all(text, tag_token)
    }

    /// Sorted union of tags across todos.
    pub fn all_tags(todos: &[Todo]) -> Vec<String> {
        todos
            .iter()
            .flat_map(|t| t.tags.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /* ------------------------------ Priority ------------------------------ */

    /// Smallest positive `N` among `!pN` markers.
    pub fn extract_priority(text: &str) -> Option<u32> {
        find_all(text, priority_token)
            .into_iter()
            .filter_map(|(_, digits)| digits.parse::<u32>().ok())
            .filter(|p| *p > 0)
            .min()
    }

    pub fn has_priority(text: &str) -> bool {
        !find_all(text, priority_token).is_empty()
    }

    pub fn remove_priority(text: &str) -> String {
        remove_all(text, priority_token)
    }

    pub fn priority_marker(text: &str) -> Option<&str> {
        first_match(text, priority_token)
    }

    pub fn all_priorities(todos: &[Todo]) -> Vec<u32> {
        todos
            .iter()
            .filter_map(|t| t.priority)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /* ------------------------------ Due dates ------------------------------ */

    /// Earliest valid date among `@due(...)` markers; impossible dates are skipped.
    pub fn extract_due_date(text: &str) -> Option<NaiveDate> {
        find_all(text, due_token)
            .into_iter()
            .filter_map(|(_, date)| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
            .min()
    }

    pub fn has_due_date(text: &str) -> bool {
        !find_all(text, due_token).is_empty()
    }

    pub fn remove_due_date(text: &str) -> String {
        remove_all(text, due_token)
    }

    pub fn due_marker(text: &str) -> Option<&str> {
        first_match(text, due_token)
    }

    pub fn all_due_dates(todos: &[Todo]) -> Vec<NaiveDate> {
        todos
            .iter()
            .filter_map(|t| t.due_date)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_overdue(due: Option<NaiveDate>, today: NaiveDate) -> bool {
        due.is_some_and(|d| d < today)
    }

    pub fn is_due_today(due: Option<NaiveDate>, today: NaiveDate) -> bool {
        due == Some(today)
    }

    /// Due after today and at most `days` days out.
    pub fn is_due_soon(due: Option<NaiveDate>, days: u64, today: NaiveDate) -> bool {
        let Some(d) = due else {
            return false;
        };
        d > today
            && today
                .checked_add_days(Days::new(days))
                .is_some_and(|deadline| d <= deadline)
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DueFilter {
        /// Any todo with a due date.
        All,
        Overdue,
        Today,
        /// Today or within the next seven days.
        Week,
    }

    /// Removes every tag, priority and due marker and collapses the leftover whitespace.
    pub fn strip_annotations(text: &str) -> String {
        let text = remove_due_date(&remove_priority(&remove_tags(text)));
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    impl Todo {
        pub fn has_tag(&self, tag: &str) -> bool {
            self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
        }

        /// True when any of `tags` is present; an empty filter matches everything.
        pub fn has_any_tag<S: AsRef<str>>(&self, tags: &[S]) -> bool {
            tags.is_empty() || tags.iter().any(|t| self.has_tag(t.as_ref()))
        }

        pub fn has_any_priority(&self, priorities: &[u32]) -> bool {
            priorities.is_empty() || self.priority.is_some_and(|p| priorities.contains(&p))
        }

        pub fn is_overdue(&self, today: NaiveDate) -> bool {
            is_overdue(self.due_date, today)
        }

        pub fn is_due_today(&self, today: NaiveDate) -> bool {
            is_due_today(self.due_date, today)
        }

        pub fn is_due_soon(&self, days: u64, today: NaiveDate) -> bool {
            is_due_soon(self.due_date, days, today)
        }

        pub fn matches_due_filter(&self, filter: DueFilter, today: NaiveDate) -> bool {
            match filter {
                DueFilter::All => self.due_date.is_some(),
                DueFilter::Overdue => self.is_overdue(today),
                DueFilter::Today => self.is_due_today(today),
                DueFilter::Week => self.is_due_today(today) || self.is_due_soon(7, today),
            }
        }

        pub fn matches_any_due_filter(&self, filters: &[DueFilter], today: NaiveDate) -> bool {
            filters.is_empty() || filters.iter().any(|f| self.matches_due_filter(*f, today))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn day(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
        }

        fn todo(text: &str) -> Todo {
            Todo {
                index: 0,
                checked: false,
                text: text.to_string(),
                depth: 0,
                parent_index: None,
                tags: extract_tags(text),
                priority: extract_priority(text),
                due_date: extract_due_date(text),
            }
        }

        #[test]
        fn all_markers_in_one_line() {
            let text = "Fix bug !p1 @due(2025-11-30) #urgent #backend";
            assert_eq!(extract_priority(text), Some(1));
            assert_eq!(extract_due_date(text), Some(day(2025, 11, 30)));
            assert_eq!(extract_tags(text), vec!["urgent", "backend"]);
            assert_eq!(strip_annotations(text), "Fix bug");
        }

        #[test]
        fn tags_are_deduplicated_case_sensitively() {
            assert_eq!(
                extract_tags("#a #b #a #A #with-dash #under_score #!bang"),
                vec!["a", "b", "A", "with-dash", "under_score"]
            );
            assert!(extract_tags("no tags here # alone").is_empty());
            assert_eq!(remove_tags("ship it #release #now"), "ship it");
        }

        #[test]
        fn tag_queries_ignore_case() {
            let t = todo("deploy #Backend");
            assert!(t.has_tag("backend"));
            assert!(t.has_any_tag::<&str>(&[]));
            assert!(t.has_any_tag(&["frontend", "BACKEND"]));
            assert!(!t.has_any_tag(&["frontend"]));
        }

        #[test]
        fn smallest_positive_priority_wins() {
            assert_eq!(extract_priority("!p3 then !p2 and !p10"), Some(2));
            assert_eq!(extract_priority("!p0 only"), None);
            assert!(has_priority("!p0 only"));
            assert_eq!(extract_priority("!p99999999999 !p4"), Some(4));
            assert_eq!(extract_priority("p1 !P1 !p"), None);
            assert_eq!(priority_marker("x !p7 !p1"), Some("!p7"));
            assert_eq!(remove_priority("!p1 ship !p2"), "ship");
        }

        #[test]
        fn earliest_valid_due_date_wins() {
            let text = "@due(2025-12-01) @due(2025-02-30) @due(2025-11-15)";
            assert_eq!(extract_due_date(text), Some(day(2025, 11, 15)));
            assert_eq!(extract_due_date("@due(2025-2-01) @due(2025/02/01)"), None);
            assert!(!has_due_date("@due(2025-2-01)"));
            assert_eq!(due_marker("a @due(2025-01-02) b"), Some("@due(2025-01-02)"));
            assert_eq!(remove_due_date("pay @due(2025-01-02)"), "pay");
        }

        #[test]
        fn due_filters_are_relative_to_today() {
            let today = day(2025, 6, 10);
            let overdue = todo("a @due(2025-06-09)");
            let due_today = todo("b @due(2025-06-10)");
            let soon = todo("c @due(2025-06-17)");
            let later = todo("d @due(2025-06-18)");
            let none = todo("e");

            assert!(overdue.is_overdue(today));
            assert!(due_today.is_due_today(today));
            assert!(!due_today.is_due_soon(7, today));
            assert!(soon.is_due_soon(7, today));
            assert!(!later.is_due_soon(7, today));

            let week: Vec<bool> = [&overdue, &due_today, &soon, &later, &none]
                .iter()
                .map(|t| t.matches_due_filter(DueFilter::Week, today))
                .collect();
            assert_eq!(week, vec![false, true, true, false, false]);
            assert!(!none.matches_due_filter(DueFilter::All, today));
            assert!(none.matches_any_due_filter(&[], today));
            assert!(overdue.matches_any_due_filter(&[DueFilter::Today, DueFilter::Overdue], today));
        }

        #[test]
        fn collections_are_sorted_and_unique() {
            let todos = vec![todo("x #b !p2 @due(2025-03-01)"), todo("y #a #b !p1 @due(2025-01-01)")];
            assert_eq!(all_tags(&todos), vec!["a", "b"]);
            assert_eq!(all_priorities(&todos), vec![1, 2]);
            assert_eq!(all_due_dates(&todos), vec![day(2025, 1, 1), day(2025, 3, 1)]);
            assert!(todos[0].has_any_priority(&[2, 3]));
            assert!(!todos[0].has_any_priority(&[1]));
        }

        #[test]
        fn stripping_collapses_inner_whitespace() {
            assert_eq!(
                strip_annotations("  Call  #home Bob !p2   about @due(2025-01-01) lunch "),
                "Call Bob about lunch"
            );
        }
    }
}

pub mod document {
    //! One open markdown document: buffer, tree and metadata behind a small API.

    use crate::core::*;
    use crate::metadata::{Metadata, MetadataError, parse_frontmatter};
    use crate::{edit, extract, format, parser};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Document {
        source: SourceBuffer,
        tree: Tree,
        metadata: Metadata,
    }

    impl Default for Document {
        fn default() -> Self {
            parse(format::DEFAULT_HEADING).document
        }
    }

    /// Result of [`parse`]: the document plus its first projections.
    #[derive(Debug)]
    pub struct Parsed {
        pub document: Document,
        pub todos: Vec<Todo>,
        pub headings: Vec<Heading>,
        /// Frontmatter that was present but rejected; the document opened with empty metadata.
        pub metadata_error: Option<MetadataError>,
    }

    pub fn parse(input: &str) -> Parsed {
        let frontmatter = parse_frontmatter(input);
        let (source, tree) = parser::parse_markdown(frontmatter.body);
        let document = Document {
            source,
            tree,
            metadata: frontmatter.metadata,
        };
        let todos = document.todos();
        let headings = document.headings();
        tracing::debug!(
            todos = todos.len(),
            headings = headings.len(),
            "opened document"
        );
        Parsed {
            document,
            todos,
            headings,
            metadata_error: frontmatter.error,
        }
    }

    impl Document {
        pub fn todos(&self) -> Vec<Todo> {
            extract::extract_todos(&self.tree, &self.source)
        }

        pub fn headings(&self) -> Vec<Heading> {
            extract::extract_headings(&self.tree, &self.source)
        }

        pub fn serialize(&self) -> String {
            format::format_document(&self.tree, &self.source, &self.metadata)
        }

        pub fn metadata(&self) -> &Metadata {
            &self.metadata
        }

        pub fn metadata_mut(&mut self) -> &mut Metadata {
            &mut self.metadata
        }

        pub fn tree(&self) -> &Tree {
            &self.tree
        }

        pub fn source(&self) -> &SourceBuffer {
            &self.source
        }

        pub fn toggle_check(&mut self, index: usize) -> Result<(), EditError> {
            edit::toggle_check(&mut self.tree, index)
        }

        pub fn set_text(&mut self, index: usize, text: &str) -> Result<(), EditError> {
            edit::set_text(&mut self.tree, &mut self.source, index, text)
        }

        /// Returns the index of the new todo.
        pub fn insert(
            &mut self,
            after: Option<usize>,
            text: &str,
            checked: bool,
        ) -> Result<usize, EditError> {
            edit::insert(&mut self.tree, &mut self.source, after, text, checked)
        }

        /// Adds a todo after every existing one and returns its index.
        pub fn append(&mut self, text: &str, checked: bool) -> Result<usize, EditError> {
            edit::append(&mut self.tree, &mut self.source, text, checked)
        }

        pub fn delete(&mut self, index: usize) -> Result<(), EditError> {
            edit::delete(&mut self.tree, index)
        }

        pub fn move_todo(&mut self, from: usize, to: usize, after: bool) -> Result<(), EditError> {
            edit::move_todo(&mut self.tree, from, to, after)
        }

        pub fn swap(&mut self, i: usize, j: usize) -> Result<(), EditError> {
            edit::swap(&mut self.tree, i, j)
        }

        pub fn indent(&mut self, index: usize) -> Result<(), EditError> {
            edit::indent(&mut self.tree, index)
        }

        pub fn outdent(&mut self, index: usize) -> Result<(), EditError> {
            edit::outdent(&mut self.tree, index)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parse_returns_projections_and_keeps_metadata() {
            let input = r#"---
show-headings: true
---
# Work

- [ ] Write report #work !p1
- [x] Send invoice
"#;
            let parsed = parse(input);
            assert!(parsed.metadata_error.is_none());
            assert_eq!(parsed.todos.len(), 2);
            assert_eq!(parsed.headings[0].text, "Work");
            assert_eq!(parsed.document.metadata().show_headings, Some(true));
            assert_eq!(parsed.document.serialize(), input);
        }

        #[test]
        fn bad_frontmatter_is_recovered() {
            let parsed = parse("---\nbogus: 1\n---\n- [ ] a\n");
            assert!(parsed.metadata_error.is_some());
            assert_eq!(parsed.todos.len(), 1);
            assert_eq!(parsed.document.serialize(), "# Todos\n\n- [ ] a\n");
        }

        #[test]
        fn default_document_has_the_default_heading() {
            let doc = Document::default();
            assert!(doc.todos().is_empty());
            assert_eq!(doc.serialize(), format::DEFAULT_HEADING.trim_end().to_string() + "\n");
        }

        #[test]
        fn append_adds_the_last_todo() {
            let mut doc = parse("# T\n\n- [ ] a\n  - [ ] b\n").document;
            assert_eq!(doc.append("c", true).expect("append"), 2);
            assert_eq!(doc.serialize(), "# T\n\n- [ ] a\n  - [ ] b\n- [x] c\n");
        }

        #[test]
        fn edits_are_visible_in_the_next_extraction() {
            let mut doc = parse("# T\n\n- [ ] a\n- [ ] b\n").document;
            let i = doc.insert(Some(1), "c @due(2025-01-01)", false).expect("insert");
            assert_eq!(i, 2);
            doc.toggle_check(0).expect("toggle");
            doc.move_todo(2, 0, false).expect("move");
            doc.indent(1).expect("indent");
            doc.set_text(2, "b!").expect("set");
            let todos = doc.todos();
            let summary: Vec<_> = todos
                .iter()
                .map(|t| (t.text.as_str(), t.checked, t.depth))
                .collect();
            assert_eq!(
                summary,
                vec![
                    ("c @due(2025-01-01)", false, 0),
                    ("a", true, 1),
                    ("b!", false, 0)
                ]
            );
            assert_eq!(todos[0].due_date, chrono::NaiveDate::from_ymd_opt(2025, 1, 1));
            assert_eq!(
                doc.serialize(),
                "# T\n\n- [ ] c @due(2025-01-01)\n  - [x] a\n- [ ] b!\n"
            );
            doc.outdent(1).expect("outdent");
            doc.swap(0, 2).expect("swap");
            doc.delete(1).expect("delete");
            let texts: Vec<_> = doc.todos().into_iter().map(|t| t.text).collect();
            assert_eq!(texts, vec!["b!", "c @due(2025-01-01)"]);
        }
    }
}

pub mod config {
    //! User configuration file and the view options derived from it.

    use std::env;
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use serde::{Deserialize, Serialize};
    use serde_with::skip_serializing_none;

    use crate::metadata::Metadata;

    pub const DEFAULT_MAX_RECENT_FILES: usize = 20;

    /// Keys this version does not know are ignored, so a shared config file stays usable.
    #[skip_serializing_none]
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct UserConfig {
        pub filter_done: Option<bool>,
        pub max_visible: Option<usize>,
        pub show_headings: Option<bool>,
        pub read_only: Option<bool>,
        pub word_wrap: Option<bool>,
        pub max_recent_files: Option<usize>,
    }

    impl UserConfig {
        pub fn max_recent_files(&self) -> usize {
            self.max_recent_files.unwrap_or(DEFAULT_MAX_RECENT_FILES)
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("failed to read config {}", path.display())]
        Read {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("invalid config {}: {source}", path.display())]
        Decode {
            path: PathBuf,
            #[source]
            source: serde_yaml::Error,
        },
    }

    /// `$XDG_CONFIG_HOME/mdtodo/config.yaml`, else `~/.config/mdtodo/config.yaml`.
    pub fn config_path() -> Option<PathBuf> {
        let base = env::var_os("XDG_CONFIG_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("mdtodo").join("config.yaml"))
    }

    /// Missing file means defaults.
    pub fn load_config(path: &Path) -> Result<UserConfig, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no user config, using defaults");
                return Ok(UserConfig::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if text.trim().is_empty() {
            return Ok(UserConfig::default());
        }
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_user_config() -> Result<UserConfig, ConfigError> {
        match config_path() {
            Some(path) => load_config(&path),
            None => Ok(UserConfig::default()),
        }
    }

    /// Effective display options. Document metadata overrides the user config, which overrides
    /// the defaults.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ViewOptions {
        pub filter_done: bool,
        /// `0` shows every todo.
        pub max_visible: usize,
        pub show_headings: bool,
        pub read_only: bool,
        pub word_wrap: bool,
    }

    impl Default for ViewOptions {
        fn default() -> Self {
            Self {
                filter_done: false,
                max_visible: 0,
                show_headings: false,
                read_only: false,
                word_wrap: true,
            }
        }
    }

    impl ViewOptions {
        pub fn resolve(config: &UserConfig, metadata: &Metadata) -> Self {
            let d = Self::default();
            Self {
                filter_done: metadata
                    .filter_done
                    .or(config.filter_done)
                    .unwrap_or(d.filter_done),
                max_visible: metadata
                    .max_visible
                    .or(config.max_visible)
                    .unwrap_or(d.max_visible),
                show_headings: metadata
                    .show_headings
                    .or(config.show_headings)
                    .unwrap_or(d.show_headings),
                read_only: metadata.read_only.or(config.read_only).unwrap_or(d.read_only),
                word_wrap: metadata.word_wrap.or(config.word_wrap).unwrap_or(d.word_wrap),
            }
        }
    }

}

pub mod storage {
    //! Files on disk: load, save, and detect edits made by someone else in between.

    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use anyhow::{Context, Result};
    use chrono::{DateTime, Utc};

    use crate::document::{self, Document};
    use crate::metadata::MetadataError;

    /// Modification times closer than this are treated as equal.
    const MTIME_TOLERANCE_MS: i64 = 1000;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileStamp {
        pub modified: DateTime<Utc>,
    }

    impl FileStamp {
        /// `None` when the file does not exist.
        pub fn of(path: &Path) -> Result<Option<Self>> {
            match fs::metadata(path) {
                Ok(meta) => {
                    let modified = meta
                        .modified()
                        .with_context(|| format!("reading mtime of {:?}", path))?;
                    Ok(Some(Self {
                        modified: DateTime::<Utc>::from(modified),
                    }))
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err).with_context(|| format!("stat {:?}", path)),
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum StorageError {
        #[error("{} was changed by another program since it was read", path.display())]
        ChangedExternally { path: PathBuf },
    }

    #[derive(Debug)]
    pub struct StoredDocument {
        pub path: PathBuf,
        pub document: Document,
        /// Disk state when the document was read or last written; `None` if the file did not exist.
        pub stamp: Option<FileStamp>,
        pub metadata_error: Option<MetadataError>,
    }

    pub trait DocumentStore {
        fn load(&self, path: &Path) -> Result<StoredDocument>;
        fn save(&self, stored: &mut StoredDocument) -> Result<()>;
    }

    /// Plain filesystem store with external-change detection on save.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FsStore;

    impl DocumentStore for FsStore {
        fn load(&self, path: &Path) -> Result<StoredDocument> {
            read_document(path)
        }

        fn save(&self, stored: &mut StoredDocument) -> Result<()> {
            write_document(stored)
        }
    }

    pub fn read_document(path: &Path) -> Result<StoredDocument> {
        let Some(stamp) = FileStamp::of(path)? else {
            tracing::debug!(path = %path.display(), "file missing, starting a new document");
            return Ok(StoredDocument {
                path: path.to_path_buf(),
                document: Document::default(),
                stamp: None,
                metadata_error: None,
            });
        };
        let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        let parsed = document::parse(&text);
        Ok(StoredDocument {
            path: path.to_path_buf(),
            document: parsed.document,
            stamp: Some(stamp),
            metadata_error: parsed.metadata_error,
        })
    }

    /// Whether the file's mtime moved more than a second away from `stamp`.
    pub fn has_changed_since(path: &Path, stamp: &FileStamp) -> Result<bool> {
        Ok(match FileStamp::of(path)? {
            Some(now) => (now.modified - stamp.modified).num_milliseconds().abs() > MTIME_TOLERANCE_MS,
            None => false,
        })
    }

    /// Saves unless the file changed on disk (or appeared) since it was read.
    pub fn write_document(stored: &mut StoredDocument) -> Result<()> {
        let conflict = match &stored.stamp {
            Some(stamp) => has_changed_since(&stored.path, stamp)?,
            None => stored.path.exists(),
        };
        if conflict {
            return Err(StorageError::ChangedExternally {
                path: stored.path.clone(),
            }
            .into());
        }
        write_document_unchecked(stored)
    }

    /// Writes through a temp file in the same directory, then renames over the target.
    pub fn write_document_unchecked(stored: &mut StoredDocument) -> Result<()> {
        let path = &stored.path;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", dir))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "todo.md".to_string());
        let tmp = dir.join(format!(".{name}.tmp"));
        fs::write(&tmp, stored.document.serialize())
            .with_context(|| format!("writing {:?}", tmp))?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {:?}", path))?;
        stored.stamp = FileStamp::of(path)?;
        tracing::debug!(path = %path.display(), "saved document");
        Ok(())
    }

}

pub use document::{Document, Parsed, parse};
pub use format::format_document;
pub use parser::parse_markdown;
