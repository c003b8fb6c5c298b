use std::borrow::Cow;

/// Discriminant of an [`Object`] variant.
///
/// The values double as the codec's on-wire type tags.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Null = 0,
    Bool = 1,
    I64 = 2,
    F64 = 3,
    Bytes = 4,
    List = 5,
    Map = 6,
}

impl Kind {
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Null),
            1 => Some(Self::Bool),
            2 => Some(Self::I64),
            3 => Some(Self::F64),
            4 => Some(Self::Bytes),
            5 => Some(Self::List),
            6 => Some(Self::Map),
            _ => None,
        }
    }
}

/// Ordered key/value pairs with byte-string keys.
///
/// Duplicate keys are legal at the wire level; lookup is first-wins.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Map<'a>(pub Vec<(Cow<'a, [u8]>, Object<'a>)>);

impl<'a> Map<'a> {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First entry whose key equals `key`, if any.
    pub fn get(&self, key: &[u8]) -> Option<&Object<'a>> {
        self.0.iter().find(|(k, _)| k.as_ref() == key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: impl Into<Cow<'a, [u8]>>, value: Object<'a>) {
        self.0.push((key.into(), value));
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (Cow<'a, [u8]>, Object<'a>)> {
        self.0.iter()
    }

    pub fn into_owned(self) -> Map<'static> {
        Map(self
            .0
            .into_iter()
            .map(|(k, v)| (Cow::Owned(k.into_owned()), v.into_owned()))
            .collect())
    }
}

impl<'a> FromIterator<(Cow<'a, [u8]>, Object<'a>)> for Map<'a> {
    fn from_iter<T: IntoIterator<Item = (Cow<'a, [u8]>, Object<'a>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Tagged object tree carried in bus payloads.
///
/// Byte fields borrow the decode buffer by default; [`Object::into_owned`]
/// is the claim step that copies everything out so the value can outlive
/// the receive buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Object<'a> {
    #[default]
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Bytes(Cow<'a, [u8]>),
    List(Vec<Object<'a>>),
    Map(Map<'a>),
}

impl<'a> Object<'a> {
    pub fn bytes(b: impl Into<Cow<'a, [u8]>>) -> Self {
        Self::Bytes(b.into())
    }

    /// Byte string from a `&str`; bytes are opaque, no encoding implied.
    pub fn str(s: &'a str) -> Self {
        Self::Bytes(Cow::Borrowed(s.as_bytes()))
    }

    pub const fn kind(&self) -> Kind {
        match self {
            Self::Null => Kind::Null,
            Self::Bool(_) => Kind::Bool,
            Self::I64(_) => Kind::I64,
            Self::F64(_) => Kind::F64,
            Self::Bytes(_) => Kind::Bytes,
            Self::List(_) => Kind::List,
            Self::Map(_) => Kind::Map,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_ref()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Object<'a>]> {
        match self {
            Self::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map<'a>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Copies every borrowed byte field, detaching the value from the
    /// buffer it was decoded out of.
    pub fn into_owned(self) -> Object<'static> {
        match self {
            Self::Null => Object::Null,
            Self::Bool(b) => Object::Bool(b),
            Self::I64(i) => Object::I64(i),
            Self::F64(f) => Object::F64(f),
            Self::Bytes(b) => Object::Bytes(Cow::Owned(b.into_owned())),
            Self::List(l) => Object::List(l.into_iter().map(Object::into_owned).collect()),
            Self::Map(m) => Object::Map(m.into_owned()),
        }
    }

    /// Nesting depth; a scalar is depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Self::List(l) => 1 + l.iter().map(Self::depth).max().unwrap_or(0),
            Self::Map(m) => 1 + m.iter().map(|(_, v)| v.depth()).max().unwrap_or(0),
            _ => 1,
        }
    }
}

/// Builds an `Object::Map` from `key => value` pairs.
#[macro_export]
macro_rules! obj_map {
    ($($key:expr => $val:expr),* $(,)?) => {
        $crate::Object::Map($crate::Map(vec![
            $((std::borrow::Cow::Borrowed(&$key[..]), $val)),*
        ]))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_lookup_is_first_wins() {
        let mut map = Map::new();
        map.insert(b"k".as_slice(), Object::I64(1));
        map.insert(b"k".as_slice(), Object::I64(2));
        assert_eq!(map.get(b"k"), Some(&Object::I64(1)));
        assert_eq!(map.get(b"missing"), None);
    }

    #[test]
    fn depth_counts_nesting() {
        assert_eq!(Object::Null.depth(), 1);
        let nested = Object::List(vec![Object::List(vec![Object::I64(0)])]);
        assert_eq!(nested.depth(), 3);
        let map = obj_map! { b"a" => Object::List(vec![]) };
        assert_eq!(map.depth(), 2);
    }

    #[test]
    fn into_owned_detaches_borrows() {
        let buf = b"payload".to_vec();
        let obj = Object::bytes(&buf[..]);
        let owned = obj.into_owned();
        drop(buf);
        assert_eq!(owned.as_bytes(), Some(b"payload".as_slice()));
    }
}
