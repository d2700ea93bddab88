use super::{BitMap, DataType, Value};

/// An aligned time-value list: the in-memory row set of one device, holding
/// a timestamp column plus N typed value columns that share the timestamps.
/// Rows are appended in arbitrary timestamp order and sorted in place before
/// a flush hands the snapshot to the segment writer.
///
/// Invariants:
///
/// * Every column holds exactly row_count() values after any public
///   operation returns.
/// * A column's null bitmap, when present, covers exactly row_count() rows.
/// * After sort(), timestamps are ascending and rows with equal timestamps
///   retain their insertion order.
///
/// The list is single-writer; concurrent readers clone it first. Index and
/// type misuse are programmer errors and panic.
#[derive(Clone, Debug, Default)]
pub struct AlignedTvList {
    timestamps: Vec<i64>,
    columns: Vec<Column>,
}

/// One value column: typed contents plus an optional null bitmap. A bitmap
/// only masks rows; the value beneath a mark is retained and restored when
/// the row is unmarked.
#[derive(Clone, Debug)]
struct Column {
    values: ColumnValues,
    nulls: Option<BitMap>,
}

/// Typed column contents. Also the bulk-append input format: one
/// ColumnValues per logical input column.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValues {
    Boolean(Vec<bool>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Text(Vec<Vec<u8>>),
}

impl ColumnValues {
    fn new(datatype: DataType) -> Self {
        match datatype {
            DataType::Boolean => Self::Boolean(Vec::new()),
            DataType::Int32 => Self::Int32(Vec::new()),
            DataType::Int64 => Self::Int64(Vec::new()),
            DataType::Float => Self::Float(Vec::new()),
            DataType::Double => Self::Double(Vec::new()),
            DataType::Text => Self::Text(Vec::new()),
        }
    }

    /// Returns the contents' data type.
    pub fn datatype(&self) -> DataType {
        match self {
            Self::Boolean(_) => DataType::Boolean,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float(_) => DataType::Float,
            Self::Double(_) => DataType::Double,
            Self::Text(_) => DataType::Text,
        }
    }

    /// Returns the number of values.
    pub fn len(&self) -> usize {
        match self {
            Self::Boolean(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Int64(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    /// Returns true if there are no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, value: &Value) {
        match (self, value) {
            (Self::Boolean(v), Value::Boolean(b)) => v.push(*b),
            (Self::Int32(v), Value::Int32(i)) => v.push(*i),
            (Self::Int64(v), Value::Int64(i)) => v.push(*i),
            (Self::Float(v), Value::Float(f)) => v.push(*f),
            (Self::Double(v), Value::Double(d)) => v.push(*d),
            (Self::Text(v), Value::Text(bytes)) => v.push(bytes.clone()),
            (values, value) => {
                panic!("type mismatch: {} column given {} value", values.datatype(), value.datatype())
            }
        }
    }

    fn extend_from(&mut self, other: &ColumnValues, start: usize, len: usize) {
        match (self, other) {
            (Self::Boolean(v), Self::Boolean(o)) => v.extend_from_slice(&o[start..start + len]),
            (Self::Int32(v), Self::Int32(o)) => v.extend_from_slice(&o[start..start + len]),
            (Self::Int64(v), Self::Int64(o)) => v.extend_from_slice(&o[start..start + len]),
            (Self::Float(v), Self::Float(o)) => v.extend_from_slice(&o[start..start + len]),
            (Self::Double(v), Self::Double(o)) => v.extend_from_slice(&o[start..start + len]),
            (Self::Text(v), Self::Text(o)) => v.extend_from_slice(&o[start..start + len]),
            (values, other) => {
                panic!("type mismatch: {} column given {} values", values.datatype(), other.datatype())
            }
        }
    }

    fn get(&self, row: usize) -> Value {
        match self {
            Self::Boolean(v) => Value::Boolean(v[row]),
            Self::Int32(v) => Value::Int32(v[row]),
            Self::Int64(v) => Value::Int64(v[row]),
            Self::Float(v) => Value::Float(v[row]),
            Self::Double(v) => Value::Double(v[row]),
            Self::Text(v) => Value::Text(v[row].clone()),
        }
    }

    fn permute(&mut self, perm: &[usize]) {
        fn apply<T: Clone>(v: &[T], perm: &[usize]) -> Vec<T> {
            perm.iter().map(|&i| v[i].clone()).collect()
        }
        match self {
            Self::Boolean(v) => *v = apply(v, perm),
            Self::Int32(v) => *v = apply(v, perm),
            Self::Int64(v) => *v = apply(v, perm),
            Self::Float(v) => *v = apply(v, perm),
            Self::Double(v) => *v = apply(v, perm),
            Self::Text(v) => *v = apply(v, perm),
        }
    }
}

/// One rendered row: the typed cell per column, masked to None where the
/// column's bitmap marks the row null. Renders as e.g. "[false, 7, null]".
#[derive(Clone, Debug, PartialEq)]
pub struct Row(Vec<Option<Value>>);

impl Row {
    /// Returns the row's cells.
    pub fn cells(&self) -> &[Option<Value>] {
        &self.0
    }
}

impl std::fmt::Display for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, cell) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match cell {
                Some(value) => write!(f, "{value}")?,
                None => write!(f, "null")?,
            }
        }
        write!(f, "]")
    }
}

impl AlignedTvList {
    /// Creates an empty list with the given column types.
    pub fn new(datatypes: Vec<DataType>) -> Self {
        let columns = datatypes
            .into_iter()
            .map(|datatype| Column { values: ColumnValues::new(datatype), nulls: None })
            .collect();
        Self { timestamps: Vec::new(), columns }
    }

    /// Returns the number of rows.
    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns the column data types, in physical order.
    pub fn datatypes(&self) -> Vec<DataType> {
        self.columns.iter().map(|c| c.values.datatype()).collect()
    }

    /// Appends a single row. column_order[j] = k routes the value at logical
    /// input position j into physical column k, decoupling the call site's
    /// layout from the storage layout. Every physical column must be written
    /// exactly once.
    pub fn put_aligned(&mut self, timestamp: i64, values: &[Value], column_order: &[usize]) {
        assert_eq!(values.len(), self.columns.len(), "value count mismatch");
        assert_eq!(column_order.len(), self.columns.len(), "column order length mismatch");
        for (j, value) in values.iter().enumerate() {
            let column = &mut self.columns[column_order[j]];
            column.values.push(value);
            if let Some(nulls) = &mut column.nulls {
                nulls.grow(nulls.len() + 1);
            }
        }
        self.timestamps.push(timestamp);
    }

    /// Appends a run of rows from parallel arrays: len rows starting at
    /// array offset start. columns[j] and bitmaps[j] describe logical input
    /// column j and are routed through column_order like put_aligned. A
    /// bitmap covers the source arrays, so a mark at array position p masks
    /// the row appended from p.
    pub fn put_aligned_batch(
        &mut self,
        timestamps: &[i64],
        columns: &[ColumnValues],
        bitmaps: Option<&[BitMap]>,
        column_order: &[usize],
        start: usize,
        len: usize,
    ) {
        assert_eq!(columns.len(), self.columns.len(), "column count mismatch");
        assert_eq!(column_order.len(), self.columns.len(), "column order length mismatch");
        assert!(start + len <= timestamps.len(), "row range out of bounds");
        if let Some(bitmaps) = bitmaps {
            assert_eq!(bitmaps.len(), columns.len(), "bitmap count mismatch");
        }

        let base = self.row_count();
        for (j, values) in columns.iter().enumerate() {
            assert!(values.len() >= start + len, "column {} length mismatch", j);
            let column = &mut self.columns[column_order[j]];
            column.values.extend_from(values, start, len);

            let marks = bitmaps.map(|b| &b[j]).filter(|b| !b.is_all_unmarked());
            if marks.is_some() || column.nulls.is_some() {
                let nulls = column.nulls.get_or_insert_with(|| BitMap::new(base));
                nulls.grow(base + len);
                if let Some(marks) = marks {
                    for row in 0..len {
                        if marks.is_marked(start + row) {
                            nulls.mark(base + row);
                        }
                    }
                }
            }
        }
        self.timestamps.extend_from_slice(&timestamps[start..start + len]);
    }

    /// Returns the timestamp of the given row.
    pub fn get_time(&self, row: usize) -> i64 {
        assert!(row < self.row_count(), "row {} out of range {}", row, self.row_count());
        self.timestamps[row]
    }

    /// Returns the given row with null-masked cells.
    pub fn get_aligned(&self, row: usize) -> Row {
        assert!(row < self.row_count(), "row {} out of range {}", row, self.row_count());
        Row(self
            .columns
            .iter()
            .map(|column| match &column.nulls {
                Some(nulls) if nulls.is_marked(row) => None,
                _ => Some(column.values.get(row)),
            })
            .collect())
    }

    /// Returns true if the given row is masked null in the given column.
    pub fn is_null(&self, row: usize, column: usize) -> bool {
        assert!(row < self.row_count(), "row {} out of range {}", row, self.row_count());
        assert!(column < self.columns.len(), "column {} out of range", column);
        self.columns[column].nulls.as_ref().is_some_and(|nulls| nulls.is_marked(row))
    }

    /// Masks the given row null in the given column. The stored value is
    /// retained and restored by unmark_null.
    pub fn mark_null(&mut self, row: usize, column: usize) {
        assert!(row < self.row_count(), "row {} out of range {}", row, self.row_count());
        assert!(column < self.columns.len(), "column {} out of range", column);
        let rows = self.row_count();
        self.columns[column].nulls.get_or_insert_with(|| BitMap::new(rows)).mark(row);
    }

    /// Unmasks the given row in the given column.
    pub fn unmark_null(&mut self, row: usize, column: usize) {
        assert!(row < self.row_count(), "row {} out of range {}", row, self.row_count());
        assert!(column < self.columns.len(), "column {} out of range", column);
        if let Some(nulls) = &mut self.columns[column].nulls {
            nulls.unmark(row);
        }
    }

    /// Sorts the rows in place, ascending by timestamp. The sort is stable:
    /// rows with equal timestamps retain insertion order. Null bitmaps are
    /// permuted congruently with their columns.
    pub fn sort(&mut self) {
        let mut perm: Vec<usize> = (0..self.row_count()).collect();
        perm.sort_by_key(|&row| self.timestamps[row]);
        if perm.iter().enumerate().all(|(i, &row)| i == row) {
            return;
        }

        let timestamps = perm.iter().map(|&row| self.timestamps[row]).collect();
        self.timestamps = timestamps;
        for column in &mut self.columns {
            column.values.permute(&perm);
            if let Some(nulls) = &column.nulls {
                let mut sorted = BitMap::new(nulls.len());
                for (i, &row) in perm.iter().enumerate() {
                    if nulls.is_marked(row) {
                        sorted.mark(i);
                    }
                }
                column.nulls = Some(sorted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// An identity column order for n columns.
    fn identity(n: usize) -> Vec<usize> {
        (0..n).collect()
    }

    /// Renders all rows of the list.
    fn render(list: &AlignedTvList) -> Vec<String> {
        (0..list.row_count()).map(|row| list.get_aligned(row).to_string()).collect()
    }

    #[test]
    fn aligned_rows_round_trip() {
        let mut list = AlignedTvList::new(vec![DataType::Int64; 5]);
        assert_eq!(list.datatypes(), vec![DataType::Int64; 5]);
        for i in 0..1000_i64 {
            list.put_aligned(i, &vec![Value::Int64(i); 5], &identity(5));
        }
        for row in 0..list.row_count() {
            let expect = format!("[{}]", vec![row.to_string(); 5].join(", "));
            assert_eq!(list.get_aligned(row).to_string(), expect);
            assert_eq!(list.get_time(row), row as i64);
        }
    }

    #[test]
    fn sort_descending_input() {
        let datatypes = vec![
            DataType::Boolean,
            DataType::Int32,
            DataType::Int64,
            DataType::Float,
            DataType::Double,
            DataType::Text,
        ];
        let mut list = AlignedTvList::new(datatypes);
        for i in (0..=1000_i64).rev() {
            let values = vec![
                Value::from(false),
                Value::from(100_i32),
                Value::from(1000_i64),
                Value::from(0.1_f32),
                Value::from(0.2_f64),
                Value::from("Test"),
            ];
            list.put_aligned(i, &values, &identity(6));
        }
        list.sort();

        assert_eq!(list.row_count(), 1001);
        for row in 0..list.row_count() {
            assert_eq!(list.get_time(row), row as i64);
            assert_eq!(list.get_aligned(row).to_string(), "[false, 100, 1000, 0.1, 0.2, Test]");
        }
    }

    #[test]
    fn bulk_insert() {
        let mut list = AlignedTvList::new(vec![DataType::Int64; 5]);
        let timestamps: Vec<i64> = (0..=1000).rev().collect();
        let columns = vec![ColumnValues::Int64(timestamps.clone()); 5];
        list.put_aligned_batch(&timestamps, &columns, None, &identity(5), 0, 1001);

        assert_eq!(list.row_count(), 1001);
        for row in 0..list.row_count() {
            assert_eq!(list.get_time(row), (list.row_count() - 1 - row) as i64);
        }
    }

    #[test]
    fn bulk_insert_with_bitmaps() {
        let mut list = AlignedTvList::new(vec![DataType::Int64; 5]);
        let timestamps: Vec<i64> = (0..=1000).rev().collect();
        let columns = vec![ColumnValues::Int64(timestamps.clone()); 5];
        let mut bitmap = BitMap::new(1001);
        for row in (0..=1000).step_by(100) {
            bitmap.mark(row);
        }
        let bitmaps = vec![bitmap; 5];
        list.put_aligned_batch(&timestamps, &columns, Some(&bitmaps), &identity(5), 0, 1001);

        for row in 0..list.row_count() {
            assert_eq!(list.get_time(row), (list.row_count() - 1 - row) as i64);
            if row % 100 == 0 {
                assert_eq!(list.get_aligned(row).to_string(), "[null, null, null, null, null]");
                assert!(list.is_null(row, 0));
            } else {
                assert!(!list.is_null(row, 0));
            }
        }
    }

    #[test]
    fn clone_independence() {
        let mut list = AlignedTvList::new(vec![DataType::Int64; 2]);
        let timestamps: Vec<i64> = (0..10).rev().collect();
        let columns = vec![ColumnValues::Int64(timestamps.clone()); 2];
        list.put_aligned_batch(&timestamps, &columns, None, &identity(2), 0, 10);

        let clone = list.clone();
        let snapshot = render(&clone);
        let times: Vec<i64> = (0..clone.row_count()).map(|row| clone.get_time(row)).collect();

        // Mutating the original must not leak into the clone.
        list.sort();
        list.mark_null(0, 0);
        assert_eq!(render(&clone), snapshot);
        assert_eq!((0..clone.row_count()).map(|r| clone.get_time(r)).collect::<Vec<_>>(), times);
        assert_ne!(render(&list), snapshot);
    }

    #[test]
    fn column_order_remapping() {
        // Logical inputs [text, bool, int] routed into physical [bool, int, text].
        let mut list =
            AlignedTvList::new(vec![DataType::Boolean, DataType::Int64, DataType::Text]);
        let values = vec![Value::from("x"), Value::from(true), Value::from(7_i64)];
        list.put_aligned(1, &values, &[2, 0, 1]);
        assert_eq!(list.get_aligned(0).to_string(), "[true, 7, x]");
    }

    #[test]
    fn sort_is_stable() {
        let mut list = AlignedTvList::new(vec![DataType::Text]);
        for (ts, text) in [(5, "a"), (3, "x"), (5, "b"), (3, "y")] {
            list.put_aligned(ts, &[Value::from(text)], &[0]);
        }
        list.sort();
        assert_eq!(render(&list), vec!["[x]", "[y]", "[a]", "[b]"]);
        assert_eq!((0..4).map(|r| list.get_time(r)).collect::<Vec<_>>(), vec![3, 3, 5, 5]);
    }

    #[test]
    fn sort_permutes_bitmaps() {
        let mut list = AlignedTvList::new(vec![DataType::Int32]);
        for ts in (0..4_i64).rev() {
            list.put_aligned(ts, &[Value::Int32(ts as i32)], &[0]);
        }
        list.mark_null(0, 0); // masks the row with timestamp 3
        list.sort();
        assert_eq!(render(&list), vec!["[0]", "[1]", "[2]", "[null]"]);
    }

    #[test]
    fn null_mask_round_trip() {
        let mut list = AlignedTvList::new(vec![DataType::Int32, DataType::Int32]);
        list.put_aligned(1, &[Value::Int32(1), Value::Int32(2)], &identity(2));
        assert_eq!(list.get_aligned(0).to_string(), "[1, 2]");

        list.mark_null(0, 1);
        assert!(list.is_null(0, 1));
        assert!(!list.is_null(0, 0));
        assert_eq!(list.get_aligned(0).to_string(), "[1, null]");
        assert_eq!(list.get_aligned(0).cells(), [Some(Value::Int32(1)), None]);

        list.unmark_null(0, 1);
        assert_eq!(list.get_aligned(0).to_string(), "[1, 2]");
    }

    #[test]
    fn empty_sort_noop() {
        let mut list = AlignedTvList::new(vec![DataType::Int64]);
        list.sort();
        assert_eq!(list.row_count(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn get_time_out_of_range() {
        AlignedTvList::new(vec![DataType::Int64]).get_time(0);
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn put_type_mismatch() {
        let mut list = AlignedTvList::new(vec![DataType::Int64]);
        list.put_aligned(0, &[Value::from(true)], &[0]);
    }
}
